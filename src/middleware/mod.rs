pub mod host_router;
