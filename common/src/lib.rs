pub mod boot;
pub mod config;
pub mod portal;
pub mod reset;
pub mod store;

pub use boot::{run_boot, BootOutcome, NetworkJoin, RESTART_DELAY_MS};
pub use config::{DeviceConfig, FieldSpec, ThingsBoardConfig, WebThingConfig};
pub use portal::{
    html_escape, parse_form, run_portal, PortalEvent, PortalField, PortalOutcome, PortalUi,
    PORTAL_TIMEOUT_MS,
};
pub use reset::{DoubleResetDetector, FileResetMarker, ResetMarker, DOUBLE_RESET_WINDOW_MS};
pub use store::{ConfigStore, FsStorage, LoadOutcome, Storage, StoreError};
