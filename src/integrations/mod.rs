//! External service integrations.

pub mod gateway_client {
    pub use crate::gateway_client::*;
}

pub mod llm_client {
    pub use crate::llm_client::*;
}

pub mod serpro_client {
    pub use crate::serpro_client::*;
}

pub mod n8n_client {
    pub use crate::n8n_client::*;
}

pub mod realtime {
    pub use crate::realtime::*;
}

pub mod webhook_models {
    pub use crate::webhook_models::*;
}
