mod gateway_partition;
mod session_expiry;
