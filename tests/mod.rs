mod common;

mod api_tests;
mod dispatcher_tests;
