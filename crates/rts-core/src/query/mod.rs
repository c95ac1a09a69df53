pub mod guards;
pub mod reachability;
pub mod selector;
