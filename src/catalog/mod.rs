pub mod model;
pub mod store;

pub use model::{Catalog, Episode, LiveChannel, Movie, QualityTier, SdtIdentity, Season, Series};
pub use store::{CatalogError, CatalogStore};
