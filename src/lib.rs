pub mod imu_trait;
pub mod quaternion_converter;
pub mod bno08x;
pub mod simulated_imu;
pub mod precision_scheduler;
pub mod value_stats;
pub mod sink_fanout;
pub mod csv_sink;
pub mod network_sink;
pub mod live_display;
pub mod session;
