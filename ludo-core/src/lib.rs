mod backoff;
mod cache;
mod client;
mod models;
mod rate_limit;

pub use backoff::{Backoff, RetryPolicy};
pub use cache::ResponseCache;
pub use client::{ApiErrorClass, CatalogClient, CatalogError, ClientConfig};
pub use models::{
    GameDetails, Genre, Metacritic, OwnedGame, PlayerProfile, RecentGame, ReleaseDate,
    ReviewSummary,
};
pub use rate_limit::RateLimiter;
