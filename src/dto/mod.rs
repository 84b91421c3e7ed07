pub mod production;
