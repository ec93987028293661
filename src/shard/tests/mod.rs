pub mod helpers;
mod tests_read;
