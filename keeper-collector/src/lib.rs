pub mod collector;
pub mod keyboard;
pub mod normalize;
pub mod score;
pub mod seeds;

pub use collector::run;
pub use normalize::{deal_from_hit, deal_from_product, normalize, Deal};
