pub mod card_image_service;
pub mod reconciler;
pub mod storage;
