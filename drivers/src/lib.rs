#![no_std]
#![allow(unsafe_op_in_unsafe_fn)]

pub mod virtio;
pub mod virtio_serial;

pub mod test_fixtures;
pub mod virtio_queue_tests;
