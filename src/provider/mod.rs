pub mod fetch;
pub mod m3u;
pub mod probe;
pub mod state;
pub mod xtream;

pub use fetch::{FetchError, FetchOutcome, FetchStats, FetchedCatalog, ResilientFetcher};
pub use probe::{ProbeResult, ProbeStatus, RankedProviders};
pub use xtream::{XtreamClient, XtreamError};
