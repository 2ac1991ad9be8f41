pub mod endpoint;
pub mod telemetry;
pub mod util;

pub use endpoint::{
    EndpointId, EndpointRole, EndpointSpec, EndpointsFile, EndpointsFileError, ParseRoleError,
};
pub use telemetry::LogFormat;
pub use util::now_ms;
