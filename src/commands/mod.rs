pub mod inspect;
pub mod scan;
pub mod settings;
pub mod upgrade;
