pub mod container;
pub mod microvm;
