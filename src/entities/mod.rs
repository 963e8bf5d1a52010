pub mod prelude;

pub mod card_images;
pub mod users;
