//! The SIP type vocabulary: methods, status codes, URIs and the header
//! values the transaction core routes on.

pub mod address;
pub mod call_id;
pub mod cseq;
pub mod header;
pub mod method;
pub mod param;
pub mod status;
pub mod uri;
pub mod via;

pub use address::Address;
pub use call_id::CallId;
pub use cseq::CSeq;
pub use header::{Header, HeaderName, HeaderValue};
pub use method::Method;
pub use param::Params;
pub use status::StatusCode;
pub use uri::Uri;
pub use via::{ViaEntry, MAGIC_COOKIE};
