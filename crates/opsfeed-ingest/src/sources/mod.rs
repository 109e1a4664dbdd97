//! Concrete sources behind the framework's fetch traits

pub mod backup;
pub mod http;
pub mod sheets;

pub use backup::{folder_key, parse_csv, parse_json_lines, Listing, ObjectSource, ObjectStore};
pub use http::{GatewayClient, HttpDetailSource, HttpPageSource, ListRequest};
pub use sheets::SheetsSource;
