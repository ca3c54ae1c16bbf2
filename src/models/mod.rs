pub mod audit;
pub mod batch;
pub mod health;
pub mod message;
pub mod queue;
pub mod recipient;
pub mod response;
pub mod retry;
pub mod rule;
pub mod status;
pub mod template;
pub mod validation;
