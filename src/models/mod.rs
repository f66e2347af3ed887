pub mod audit;
pub mod health;
pub mod intent;
pub mod message;
pub mod outcome;
pub mod retry;
pub mod status;
pub mod template;
pub mod validation;
