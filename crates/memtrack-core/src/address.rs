use super::macros::impl_address;

impl_address!(Va, "Guest Virtual Address");
impl_address!(Pa, "Backing (Physical) Address");
