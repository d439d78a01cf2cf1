pub mod fixed_buffer;
pub mod packet_pool;
pub mod window_ring;
