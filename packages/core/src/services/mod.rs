pub mod mock_partner;
pub mod partner;
