pub mod bbox;
pub mod detection;
pub mod geo;
pub mod labels;
pub mod trajectory;
pub mod zones;
