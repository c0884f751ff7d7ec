//! API response types, pagination and request validation

pub mod optional_json;
pub mod pagination;
pub mod response;
pub mod validated;

pub use optional_json::OptionalJson;
pub use pagination::{Paginated, PaginationParams};
pub use response::{Created, DataResponse, MessageResponse};
pub use validated::ValidatedJson;
