pub mod dispatcher;
pub mod enqueuer;
pub mod renderer;
pub mod resolver;
pub mod rules;
pub mod stats;
