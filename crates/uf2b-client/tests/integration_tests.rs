//! Integration tests for uf2b-client
//!
//! These tests serve a scripted board over HTTP and drive it through the real
//! controller client, so the wire format stays in sync with the mock router.

use std::sync::Arc;
use std::time::Duration;

use pretty_assertions::assert_eq;
use uf2b_client::testing::{mock_router, Fault, MockBoard, TestServer};
use uf2b_client::{
    Controller, DeviceRange, DeviceStage, FailureCause, FlashConfig, FlashError, FlashEvent,
    FlashSequencer, HttpController, RebootMode, Request,
};
use uf2b_core::{DeviceState, FirmwareImage, StatusCode, PLACEHOLDER_WORD};

// =============================================================================
// Fixtures
// =============================================================================

fn image() -> FirmwareImage {
    let mut bytes = vec![0u8; 2048];
    for at in [40, 512 + 100] {
        bytes[at..at + 4].copy_from_slice(&PLACEHOLDER_WORD.to_le_bytes());
    }
    FirmwareImage::new("blink.uf2", bytes).unwrap()
}

/// Short timings so a full run takes a fraction of a second
fn fast_config(server: &TestServer, capacity: usize) -> FlashConfig {
    server
        .config()
        .capacity(capacity)
        .poll_ms(10)
        .settle_ms(10)
        .cdc_timeout_ms(500)
        .msc_timeout_ms(1_000)
        .flash_timeout_ms(2_000)
        .request_timeout_ms(2_000)
        .build()
}

async fn serve(capacity: usize) -> (Arc<MockBoard>, TestServer) {
    let board = Arc::new(MockBoard::new(capacity));
    let server = TestServer::start(mock_router(board.clone())).await.unwrap();
    (board, server)
}

// =============================================================================
// Controller Tests
// =============================================================================

#[tokio::test]
async fn test_status_and_select_over_http() {
    let (board, server) = serve(2).await;
    let controller = HttpController::new(fast_config(&server, 2)).unwrap();

    let snapshot = controller.execute(&Request::Status).await.unwrap();
    assert_eq!(snapshot.codes(), &[StatusCode(0x00), StatusCode(0x00)]);

    let snapshot = controller
        .execute(&Request::Select { device: 0 })
        .await
        .unwrap();
    assert_eq!(snapshot.codes(), &[StatusCode(0x01), StatusCode(0x00)]);
    assert_eq!(board.request_log(), vec!["status", "select 0"]);
}

#[tokio::test]
async fn test_snapshot_length_must_match_capacity() {
    let (_board, server) = serve(4).await;
    let config = server.config().capacity(8).build();
    let controller = HttpController::new(config).unwrap();

    let err = controller.execute(&Request::Status).await.unwrap_err();
    assert!(matches!(err, FlashError::Snapshot(_)));
    assert!(err.is_transport());
}

#[tokio::test]
async fn test_server_error_is_surfaced() {
    let (board, server) = serve(2).await;
    let controller = HttpController::new(fast_config(&server, 2)).unwrap();

    board.fail_next_request();
    let err = controller.execute(&Request::Status).await.unwrap_err();
    assert!(matches!(err, FlashError::Server { status: 503, .. }));
}

#[tokio::test]
async fn test_console_and_reboot() {
    let (board, server) = serve(1).await;
    let controller = HttpController::new(fast_config(&server, 1)).unwrap();

    board.push_console("Hello from device 0");
    assert_eq!(
        controller.board_output().await.unwrap(),
        "Hello from device 0"
    );

    controller.reboot(RebootMode::Bootsel).await.unwrap();
    assert_eq!(board.reboots(), vec![RebootMode::Bootsel]);
}

// =============================================================================
// Flash Run Tests
// =============================================================================

#[tokio::test]
async fn test_flash_range_over_http() {
    let (board, server) = serve(4).await;
    let sequencer = FlashSequencer::connect(fast_config(&server, 4)).unwrap();

    let report = sequencer
        .run(&image(), DeviceRange::new(1, 4))
        .await
        .unwrap();

    assert_eq!(report.succeeded(), 3);
    let uploads = board.uploads();
    let devices: Vec<usize> = uploads.iter().map(|(device, _)| *device).collect();
    assert_eq!(devices, vec![1, 2, 3]);
    for (device, bytes) in &uploads {
        let index = [*device as u8, 0, 0, 0];
        assert_eq!(&bytes[40..44], &index);
        assert_eq!(&bytes[612..616], &index);
    }
    // Ports are deselected once the run is over
    assert_eq!(board.selected(), None);
}

#[tokio::test]
async fn test_failure_is_isolated_over_http() {
    let (board, server) = serve(8).await;
    board.inject(
        5,
        Fault::Report {
            at: DeviceState::BootselRequest,
            code: StatusCode(0x13),
        },
    );
    let sequencer = FlashSequencer::connect(fast_config(&server, 8)).unwrap();
    let mut events = sequencer.subscribe();

    let report = sequencer
        .run(&image(), DeviceRange::new(5, 7))
        .await
        .unwrap();

    let failed = report.get(5).unwrap();
    assert_eq!(failed.stage, DeviceStage::AwaitingBootselRequest);
    assert_eq!(
        failed.failure,
        Some(FailureCause::Protocol {
            code: StatusCode(0x13)
        })
    );
    assert!(report.get(6).unwrap().is_success());

    let mut failures = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let FlashEvent::DeviceFailed { device, reason, .. } = event {
            failures.push((device, reason));
        }
    }
    assert_eq!(
        failures,
        vec![(
            5,
            "Unexpected status code on device 5: 0x13".to_string()
        )]
    );
}

#[tokio::test]
async fn test_unreachable_controller_is_fatal() {
    // Nothing listens on the discard port
    let config = FlashConfig::builder("http://127.0.0.1:9")
        .capacity(2)
        .request_timeout_ms(500)
        .build();
    let sequencer = FlashSequencer::connect(config).unwrap();
    sequencer.channel().start(Duration::from_millis(50));

    let err = sequencer
        .run(&image(), DeviceRange::all(2))
        .await
        .unwrap_err();
    assert!(err.is_transport());
    assert!(!sequencer.is_running());
    assert!(sequencer.channel().is_running());
    sequencer.channel().stop();
}
