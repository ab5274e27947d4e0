pub mod cache;
pub mod http;
pub mod ingress;
pub mod session;

pub use cache::VariationFilesCache;
pub use http::HttpVariationRepository;
pub use session::VariationSession;
