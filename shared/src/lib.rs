pub mod codec;
pub mod protocol;
pub mod types;
pub mod uri;

pub use codec::CodecError;
pub use types::{RecordError, ServiceRecord};
pub use uri::{ServiceUri, UriError};
