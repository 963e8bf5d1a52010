pub use super::card_images::Entity as CardImages;
pub use super::users::Entity as Users;
