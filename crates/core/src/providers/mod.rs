pub mod local;
pub mod openai;

pub use local::{CharacterNgramEmbedder, OfflineCompletion, TextLayerOnly, OFFLINE_REPLY};
pub use openai::{OpenAiClient, OpenAiConfig};
