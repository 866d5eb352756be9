//! Semantic response caching.

pub mod embedding;
pub mod engine;
pub mod fingerprint;
pub mod flight;
pub mod vector_index;

pub use embedding::{Embedder, EmbedderError, HashEmbedder, HttpEmbedder};
pub use engine::{CacheEngine, CacheLookup, InsertOutcome};
pub use fingerprint::{NormalizedRequest, fingerprint, normalize_chat, normalize_completion, normalize_embedding};
pub use flight::{FlightFollower, FlightGuard, FlightJoin, FlightMap, FlightResult, FollowerOutcome};
pub use vector_index::{
    CacheEntry, InvalidationFilter, MemoryVectorIndex, ScoredEntry, VectorIndex, VectorIndexError,
    cosine_similarity,
};
