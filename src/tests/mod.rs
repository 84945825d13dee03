mod concurrent_tests;
mod config_tests;
mod recovery_tests;
mod safety_tests;
