pub mod auth;
pub mod card_images;
pub mod health;
pub mod pages;
