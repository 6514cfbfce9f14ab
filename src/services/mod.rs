pub mod enumerator;
pub mod notifier;
pub mod resolver;
pub mod sender;
