//! Suite registry and runner for the transport stack's built-in tests.
//!
//! Each crate keeps its tests next to the code they exercise; this crate
//! collects them into suites and walks the registry.

#![no_std]

pub use vport_lib::testing::{
    HARNESS_MAX_SUITES, TestRunSummary, TestSuiteDesc, TestSuiteResult,
};
use vport_lib::klog_info;

use vport_drivers::{virtio_device_tests, virtio_queue_tests, virtio_serial_tests};
use vport_mm::{dma_tests, mmio_tests};

vport_lib::define_test_suite!(
    dma,
    [
        dma_tests::test_dma_alloc_free_roundtrip,
        dma_tests::test_dma_exhaustion_returns_no_memory,
        dma_tests::test_dma_address_limit_enforced,
        dma_tests::test_dma_refcount_shared_release,
        dma_tests::test_dma_park_and_reclaim,
        dma_tests::test_dma_reclaim_rejects_foreign_address,
    ]
);

vport_lib::define_test_suite!(
    mmio,
    [
        mmio_tests::test_mmio_empty_region_state,
        mmio_tests::test_mmio_is_valid_offset_overflow,
        mmio_tests::test_mmio_read_write_roundtrip,
        mmio_tests::test_mmio_map_through_translation,
        mmio_tests::test_mmio_map_rejects_null_and_empty,
        mmio_tests::test_mmio_unmap_clears_region,
    ]
);

vport_lib::define_test_suite!(
    register_bank,
    [
        virtio_device_tests::test_register_bank_status_flow,
        virtio_device_tests::test_register_bank_feature_negotiation,
        virtio_device_tests::test_register_bank_queue_protocol,
    ]
);

vport_lib::define_test_suite!(
    virtqueue,
    [
        virtio_queue_tests::test_vring_layout,
        virtio_queue_tests::test_queue_publish_complete_roundtrip,
        virtio_queue_tests::test_queue_ring_full,
        virtio_queue_tests::test_queue_shutdown_drains_and_rejects,
        virtio_queue_tests::test_queue_ignores_bad_used_id,
        virtio_queue_tests::test_fill_queue_stocks_ring,
        virtio_queue_tests::test_fill_queue_propagates_exhaustion,
    ]
);

vport_lib::define_test_suite!(
    serial_core,
    [
        virtio_serial_tests::test_prepare_requires_port_resource,
        virtio_serial_tests::test_prepare_singleport,
        virtio_serial_tests::test_prepare_multiport_negotiation,
        virtio_serial_tests::test_prepare_clamps_port_count,
        virtio_serial_tests::test_prepare_attaches_port_window,
        virtio_serial_tests::test_prepare_maps_memory_window,
        virtio_serial_tests::test_prepare_rejects_wide_port_base,
        virtio_serial_tests::test_slot_for_ordinal_mapping,
        virtio_serial_tests::test_delete_queue_empty_slot_is_noop,
        virtio_serial_tests::test_init_all_queues_multiport,
        virtio_serial_tests::test_init_singleport_has_no_control_pair,
        virtio_serial_tests::test_shutdown_withdraws_driver_ok_first,
        virtio_serial_tests::test_d0_entry_brings_queues_up,
        virtio_serial_tests::test_d0_entry_flags_failed_device,
        virtio_serial_tests::test_d0_entry_guards_lifecycle,
        virtio_serial_tests::test_d0_exit_and_power_cycle,
        virtio_serial_tests::test_release_hardware,
        virtio_serial_tests::test_interrupt_registration_refuses_second,
        virtio_serial_tests::test_interrupt_service_reads_isr_once,
        virtio_serial_tests::test_readiness_handshake,
        virtio_serial_tests::test_drain_control_queue_delivers_and_restocks,
        virtio_serial_tests::test_drain_control_queue_skips_runt_messages,
    ]
);

/// Every registered suite, in execution order.
pub static SUITES: &[TestSuiteDesc] = &[
    DMA_SUITE,
    MMIO_SUITE,
    REGISTER_BANK_SUITE,
    VIRTQUEUE_SUITE,
    SERIAL_CORE_SUITE,
];

/// Run every suite and fold the results into a summary. Returns 0 when
/// everything passed.
pub fn tests_run_all(summary: &mut TestRunSummary) -> i32 {
    *summary = TestRunSummary::default();
    klog_info!("TESTS: starting {} suites", SUITES.len());

    for desc in SUITES {
        let mut res = TestSuiteResult::default();
        res.name = desc.name;
        if let Some(run) = desc.run {
            run(&mut res);
        }
        klog_info!(
            "SUITE {}: total={} pass={} fail={}",
            res.name,
            res.total,
            res.passed,
            res.failed,
        );
        summary.add_suite_result(&res);
    }

    klog_info!(
        "TESTS: complete, {}/{} passed",
        summary.passed,
        summary.total_tests,
    );
    if summary.all_passed() { 0 } else { -1 }
}
