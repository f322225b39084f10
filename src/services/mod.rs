//! Domain services. Each service owns a connection handle and an event
//! sender; handlers stay thin and delegate here.

pub mod carts;
pub mod order_status;
pub mod orders;
pub mod payment_gateway;
