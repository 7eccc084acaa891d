//! Encoder-only transformer models

mod bert;
mod bert_model;
mod encoder_utils;

pub use bert::{ModelOptions, SentenceTransformer};
pub use bert_model::{BertConfig, BertModel, HiddenAct};
pub use encoder_utils::{apply_pooling, cosine_similarity, normalize_embeddings};
