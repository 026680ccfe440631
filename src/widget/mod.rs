pub mod controller;
pub mod state;

pub use controller::{
    CategoryCount, RatingWidget, WidgetEvent, WidgetSnapshot, POPUP_VISIBLE_MS, VOTE_COOLDOWN_MS,
};
pub use state::{Popup, VotePhase, WidgetState};
