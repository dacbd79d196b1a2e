pub mod drop_join_handle;
