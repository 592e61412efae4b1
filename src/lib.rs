pub mod avatar;
pub mod body_frame;
pub mod character;
pub mod config;
pub mod dispatch;
pub mod entities;
pub mod filter;
pub mod follow;
pub mod math;
pub mod motor;
pub mod pose;
pub mod rig;
pub mod safe_landing;
pub mod sit_stand;
