//! Village automation core: field cache and scanner, task selection, build
//! and training executors, farm lists, and the loop that drives them through
//! one WebDriver-controlled browser tab.

pub mod activity;
pub mod build;
pub mod cache;
pub mod config;
pub mod delay;
pub mod dom;
pub mod farm;
pub mod feed;
pub mod game;
pub mod normalize;
pub mod page;
pub mod scanner;
pub mod scheduler;
pub mod selector;
pub mod status;
pub mod train;
pub mod webdriver;

#[cfg(test)]
mod testing;

#[cfg(test)]
mod tests;
