//! Test utilities for uf2b-client
//!
//! [`MockBoard`] is a scripted in-memory controller: selecting a port powers
//! it, and every status poll walks the selected device one step further
//! through the BOOTSEL and flash lifecycle. Faults can be injected per device.
//! [`mock_router`] exposes a board over the real HTTP endpoint layout and
//! [`TestServer`] serves it on an ephemeral port.

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::body::Bytes;
use axum::extract::{Query, State};
use axum::http::StatusCode as HttpStatus;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use parking_lot::Mutex;
use serde::Deserialize;
use tokio::net::TcpListener;

use uf2b_core::{DeviceState, StatusCode, StatusSnapshot, MSC_MOUNTED, TUH_MOUNTED};

use crate::config::FlashConfigBuilder;
use crate::controller::{Controller, RebootMode, Request};
use crate::error::{FlashError, Result};
use crate::FlashConfig;

const MASS_STORAGE: u8 = TUH_MOUNTED | MSC_MOUNTED;

/// Scripted misbehaviour of one device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// Report `code` instead of entering `at`
    Report { at: DeviceState, code: StatusCode },
    /// Enter `at` and never leave it
    Stall { at: DeviceState },
}

#[derive(Default)]
struct BoardState {
    codes: Vec<StatusCode>,
    selected: Option<usize>,
    faults: HashMap<usize, Fault>,
    uploads: Vec<(usize, Vec<u8>)>,
    requests: Vec<String>,
    console: VecDeque<String>,
    reboots: Vec<RebootMode>,
    fail_next: bool,
    after_clear: Option<StatusCode>,
}

/// In-memory batch flasher controller
pub struct MockBoard {
    capacity: usize,
    latency: Duration,
    boots_to_mass_storage: bool,
    state: Mutex<BoardState>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl MockBoard {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            latency: Duration::ZERO,
            boots_to_mass_storage: false,
            state: Mutex::new(BoardState {
                codes: vec![StatusCode::UNKNOWN; capacity],
                ..Default::default()
            }),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    /// Delay every request by `latency`
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Bring selected devices up already waiting for a flash request
    pub fn booting_to_mass_storage(mut self) -> Self {
        self.boots_to_mass_storage = true;
        self
    }

    pub fn inject(&self, device: usize, fault: Fault) {
        self.state.lock().faults.insert(device, fault);
    }

    /// Fail the next request with a 503
    pub fn fail_next_request(&self) {
        self.state.lock().fail_next = true;
    }

    /// Leave device 0 at `code` when all ports are cleared
    pub fn hold_after_clear(&self, code: StatusCode) {
        self.state.lock().after_clear = Some(code);
    }

    pub fn push_console(&self, line: impl Into<String>) {
        self.state.lock().console.push_back(line.into());
    }

    /// Requests seen so far, rendered as `status`, `select N`, `upload ...`
    pub fn request_log(&self) -> Vec<String> {
        self.state.lock().requests.clone()
    }

    /// Device index and bytes of every accepted upload
    pub fn uploads(&self) -> Vec<(usize, Vec<u8>)> {
        self.state.lock().uploads.clone()
    }

    pub fn reboots(&self) -> Vec<RebootMode> {
        self.state.lock().reboots.clone()
    }

    pub fn selected(&self) -> Option<usize> {
        self.state.lock().selected
    }

    /// Highest number of requests ever executing at once
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    pub fn snapshot(&self) -> StatusSnapshot {
        let state = self.state.lock();
        StatusSnapshot::from_codes(
            state.codes.iter().map(|c| c.raw()).collect::<Vec<u8>>(),
            self.capacity,
        )
        .unwrap_or_else(|_| StatusSnapshot::unknown(self.capacity))
    }

    fn apply(&self, request: &Request) -> Result<StatusSnapshot> {
        {
            let mut state = self.state.lock();
            state.requests.push(request.to_string());
            if std::mem::take(&mut state.fail_next) {
                return Err(FlashError::server_error(503, "injected failure"));
            }

            match request {
                Request::Status => Self::advance(&mut state),
                Request::Select { device } => self.select(&mut state, *device)?,
                Request::Upload { device, image } => {
                    let current = state.codes.get(*device).and_then(|c| c.state());
                    if state.selected != Some(*device) || current != Some(DeviceState::FlashRequest) {
                        return Err(FlashError::server_error(409, "device not ready for upload"));
                    }
                    state.uploads.push((*device, image.to_vec()));
                    state.codes[*device] =
                        StatusCode(MASS_STORAGE).with_state(DeviceState::FlashDiskInit);
                }
            }
        }
        Ok(self.snapshot())
    }

    fn select(&self, state: &mut BoardState, device: usize) -> Result<()> {
        if device == self.capacity {
            state.codes.iter_mut().for_each(|c| *c = StatusCode::UNKNOWN);
            if let (Some(code), Some(first)) = (state.after_clear, state.codes.first_mut()) {
                *first = code;
            }
            state.selected = None;
            return Ok(());
        }
        if device > self.capacity {
            return Err(FlashError::server_error(400, "invalid device index"));
        }

        if let Some(previous) = state.selected.replace(device) {
            state.codes[previous] = StatusCode::UNKNOWN;
        }
        state.codes[device] = if self.boots_to_mass_storage {
            StatusCode(MASS_STORAGE).with_state(DeviceState::FlashRequest)
        } else {
            DeviceState::Selected.into()
        };
        Ok(())
    }

    /// Move the selected device one lifecycle step forward
    fn advance(state: &mut BoardState) {
        let Some(device) = state.selected else {
            return;
        };
        let code = state.codes[device];
        let next = match code.state() {
            Some(DeviceState::Selected) => StatusCode::from(DeviceState::BootselRequest),
            Some(DeviceState::BootselRequest) => {
                StatusCode(MASS_STORAGE).with_state(DeviceState::BootselComplete)
            }
            Some(DeviceState::BootselComplete) => code.with_state(DeviceState::FlashRequest),
            Some(DeviceState::FlashDiskInit) => code.with_state(DeviceState::FlashDiskWriteBusy),
            Some(DeviceState::FlashDiskWriteBusy) => code.with_state(DeviceState::FlashDiskIoComplete),
            Some(DeviceState::FlashDiskIoComplete) => code.with_state(DeviceState::FlashComplete),
            // Holds until an upload arrives, and for good once finished
            _ => return,
        };

        state.codes[device] = match state.faults.get(&device) {
            Some(Fault::Stall { at }) if code.state() == Some(*at) => code,
            Some(Fault::Report { at, code: reported }) if next.state() == Some(*at) => *reported,
            _ => next,
        };
    }
}

#[async_trait]
impl Controller for MockBoard {
    fn capacity(&self) -> usize {
        self.capacity
    }

    async fn execute(&self, request: &Request) -> Result<StatusSnapshot> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        let result = self.apply(request);

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }

    async fn board_output(&self) -> Result<String> {
        let mut state = self.state.lock();
        let lines: Vec<String> = state.console.drain(..).collect();
        Ok(lines.join("\n"))
    }

    async fn reboot(&self, mode: RebootMode) -> Result<()> {
        self.state.lock().reboots.push(mode);
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
struct SelectParams {
    active_device: usize,
}

#[derive(Debug, Deserialize)]
struct RebootParams {
    #[serde(default)]
    bootsel: u8,
}

fn status_response(result: Result<StatusSnapshot>) -> Response {
    match result {
        Ok(snapshot) => Json(snapshot).into_response(),
        Err(FlashError::Server { status, message }) => (
            HttpStatus::from_u16(status).unwrap_or(HttpStatus::INTERNAL_SERVER_ERROR),
            message,
        )
            .into_response(),
        Err(e) => (HttpStatus::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

async fn status_handler(State(board): State<Arc<MockBoard>>) -> Response {
    status_response(board.execute(&Request::Status).await)
}

async fn select_handler(
    State(board): State<Arc<MockBoard>>,
    Query(params): Query<SelectParams>,
) -> Response {
    status_response(
        board
            .execute(&Request::Select {
                device: params.active_device,
            })
            .await,
    )
}

async fn flash_handler(State(board): State<Arc<MockBoard>>, body: Bytes) -> Response {
    let device = board.selected().unwrap_or(board.capacity());
    status_response(board.execute(&Request::Upload { device, image: body }).await)
}

async fn stdout_handler(State(board): State<Arc<MockBoard>>) -> Response {
    match board.board_output().await {
        Ok(text) => text.into_response(),
        Err(e) => (HttpStatus::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

async fn reboot_handler(
    State(board): State<Arc<MockBoard>>,
    Query(params): Query<RebootParams>,
) -> HttpStatus {
    let mode = if params.bootsel == 0 {
        RebootMode::Application
    } else {
        RebootMode::Bootsel
    };
    match board.reboot(mode).await {
        Ok(()) => HttpStatus::OK,
        Err(_) => HttpStatus::INTERNAL_SERVER_ERROR,
    }
}

/// Router serving `board` on the default endpoint paths
pub fn mock_router(board: Arc<MockBoard>) -> Router {
    let endpoints = FlashConfig::builder("http://localhost").build().endpoints;
    Router::new()
        .route(&endpoints.status, get(status_handler))
        .route(&endpoints.select, get(select_handler))
        .route(&endpoints.flash, post(flash_handler))
        .route(&endpoints.stdout, get(stdout_handler))
        .route(&endpoints.reboot, get(reboot_handler))
        .with_state(board)
}

/// A test server that automatically shuts down when dropped
pub struct TestServer {
    pub addr: SocketAddr,
    shutdown_tx: Option<tokio::sync::oneshot::Sender<()>>,
    handle: Option<tokio::task::JoinHandle<()>>,
}

impl TestServer {
    /// Serve `router` on an ephemeral local port
    ///
    /// # Example
    ///
    /// ```ignore
    /// use uf2b_client::testing::{mock_router, MockBoard, TestServer};
    ///
    /// let board = Arc::new(MockBoard::new(4));
    /// let server = TestServer::start(mock_router(board.clone())).await?;
    /// let config = server.config().capacity(4).build();
    /// let sequencer = FlashSequencer::connect(config)?;
    /// ```
    pub async fn start(router: Router) -> Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;

        let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel();

        let handle = tokio::spawn(async move {
            axum::serve(listener, router)
                .with_graceful_shutdown(async {
                    let _ = shutdown_rx.await;
                })
                .await
                .ok();
        });

        // Give server a moment to start
        tokio::time::sleep(Duration::from_millis(10)).await;

        Ok(Self {
            addr,
            shutdown_tx: Some(shutdown_tx),
            handle: Some(handle),
        })
    }

    /// Get the base URL of the test server
    pub fn base_url(&self) -> String {
        format!("http://{}", self.addr)
    }

    /// Configuration builder pointing at this server
    pub fn config(&self) -> FlashConfigBuilder {
        FlashConfig::builder(self.base_url())
    }

    /// Shutdown the server gracefully
    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}
