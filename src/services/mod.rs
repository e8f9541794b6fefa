pub mod completion;
pub mod mock;
pub mod openai_client;
pub mod token_estimator;

pub use completion::{
    CompletionClient, CompletionMessage, CompletionRequest, ResponseStream, StreamChunk,
};
pub use openai_client::OpenAiClient;
pub use token_estimator::{TiktokenEstimator, TokenEstimator};
