pub mod api_trait;
pub mod http;
pub mod mock;

pub use api_trait::{QrVerificationApi, ScanEventApi};
pub use http::{HttpApiClient, HttpApiOptions};
pub use mock::MockApi;
