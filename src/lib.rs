pub mod config;
pub mod error;
pub mod index;
pub mod market;
pub mod models;
pub mod solana;
pub mod web;
