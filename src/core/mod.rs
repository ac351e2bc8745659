// Domain-layer modules and shared errors/models
pub mod qualification {
    pub use crate::qualification::*;
}

pub mod agents {
    pub use crate::agents::*;
}

pub mod disparos {
    pub use crate::disparos::*;
}

pub mod templates {
    pub use crate::templates::*;
}

pub mod validation {
    pub use crate::validation::*;
}

pub mod models {
    pub use crate::models::*;
}

pub mod errors {
    pub use crate::errors::*;
}
