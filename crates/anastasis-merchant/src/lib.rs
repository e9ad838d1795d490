//! Client for the merchant backend the provider charges through.
//!
//! All operations are plain futures; dropping one cancels the
//! underlying HTTP request, which is how the request loop cancels
//! in-flight merchant work on shutdown.

mod client;

pub use client::{
    CreateOrderRequest, MerchantClient, MerchantError, OrderCreated, OrderStatus,
};
