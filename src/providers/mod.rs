//! Backend adapters.
//!
//! | Adapter | Generate | Embed | Notes |
//! |---------|----------|-------|-------|
//! | OpenAI-compatible | ✓ | ✓ | OpenAI, xAI, Ollama, LM Studio, ... |
//! | Mock | ✓ | ✓ | Scriptable, no network |

pub mod mock;
pub use mock::{MockBackend, MockEmbedder, MockReply};

pub mod openai_compatible;
pub use openai_compatible::{OpenAICompatibleBackend, OpenAICompatibleConfig};
