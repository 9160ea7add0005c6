mod common;
mod install_tests;
mod plan_tests;
