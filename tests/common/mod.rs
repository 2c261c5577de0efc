//! Test utilities for libmpy integration tests.
//!
//! [`MockDevice`] is an in-memory MicroPython board behind the `Transport`
//! trait. It follows the normal, raw and raw-paste REPL modes byte by byte
//! and interprets just enough Python to answer the probes the library
//! sends. Clones share state, so a test keeps one clone to inspect and
//! steer the device while the library owns the other.

#![allow(dead_code)]

use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use regex::Regex;

use libmpy::config::ProtocolConfigBuilder;
use libmpy::{Device, Error, ProtocolConfig, Result, Transport};

const STARTUP: &[u8] =
    b"MicroPython v1.22.0 on 2024-01-01; mock with mock\r\nType \"help()\" for more information.\r\n>>> ";
const RAW_BANNER: &[u8] = b"raw REPL; CTRL-B to exit\r\n>";
const NORMAL_PROMPT: &[u8] = b"\r\n>>> ";
const PASTE_PROBE: &[u8] = b"\x05A\x01";

static DEFINITION: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?m)^def (\w+)\(").unwrap());
static INVOCATION: Lazy<Regex> = Lazy::new(|| Regex::new(r"_mpy_r = (\w+)\(").unwrap());
static THREAD_START: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"_mpy_threads\['([^']+)'\] = True").unwrap());
static THREAD_STOP: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"_mpy_threads\['([^']+)'\] = False").unwrap());
static PRINT_SUM: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^print\((\d+)\s*\+\s*(\d+)\)$").unwrap());
static PRINT_TEXT: Lazy<Regex> = Lazy::new(|| Regex::new(r"^print\('([^']*)'\)$").unwrap());

/// How the device answers the raw-paste request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PasteSupport {
    /// `R\x01` and the window size.
    Window(u16),
    /// `R\x00`.
    Refuse,
    /// Firmware that predates raw paste and reprints the raw banner.
    Legacy,
    /// No answer at all.
    Silent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Normal,
    Raw,
    Paste,
    /// Running a program that never finishes on its own.
    Busy,
}

type Handler = Box<dyn Fn(&str) -> Option<(String, String)> + Send>;

struct State {
    open: bool,
    mode: Mode,
    paste: PasteSupport,
    grant_credit: bool,
    platform: String,
    threading: bool,

    code: Vec<u8>,
    window: usize,
    credit: usize,
    consumed: usize,
    overflowed: bool,
    paste_writes: Vec<usize>,
    outbox: Vec<u8>,

    handlers: Vec<Handler>,
    hang_on: Vec<String>,
    garbage: usize,
    dead: bool,
    pause: Option<(Vec<u8>, usize)>,
    held: Vec<u8>,
    held_polls: usize,

    defined: HashSet<String>,
    threads: BTreeSet<String>,
    programs: Vec<String>,
    writes: usize,
    bytes: usize,
    interrupts: usize,
}

impl State {
    fn new() -> Self {
        Self {
            open: false,
            mode: Mode::Normal,
            paste: PasteSupport::Window(128),
            grant_credit: true,
            platform: "rp2".to_string(),
            threading: true,
            code: Vec::new(),
            window: 0,
            credit: 0,
            consumed: 0,
            overflowed: false,
            paste_writes: Vec::new(),
            outbox: Vec::new(),
            handlers: Vec::new(),
            hang_on: Vec::new(),
            garbage: 0,
            dead: false,
            pause: None,
            held: Vec::new(),
            held_polls: 0,
            defined: HashSet::new(),
            threads: BTreeSet::new(),
            programs: Vec::new(),
            writes: 0,
            bytes: 0,
            interrupts: 0,
        }
    }

    fn emit(&mut self, bytes: &[u8]) {
        self.outbox.extend_from_slice(bytes);
    }

    fn feed(&mut self, byte: u8) {
        match self.mode {
            Mode::Normal => match byte {
                0x01 => {
                    self.code.clear();
                    self.mode = Mode::Raw;
                    self.emit(RAW_BANNER);
                }
                0x02 => self.emit(STARTUP),
                0x03 => {
                    self.interrupts += 1;
                    self.emit(NORMAL_PROMPT);
                }
                b'\r' => self.emit(NORMAL_PROMPT),
                _ => {}
            },
            Mode::Raw => match byte {
                0x01 if self.code == PASTE_PROBE[..2] => {
                    self.code.clear();
                    self.answer_paste();
                }
                0x01 => {
                    self.code.clear();
                    self.emit(RAW_BANNER);
                }
                0x02 => {
                    self.code.clear();
                    self.mode = Mode::Normal;
                    self.emit(b"\r\n");
                    self.emit(STARTUP);
                }
                0x03 => {
                    self.interrupts += 1;
                    self.code.clear();
                }
                0x04 => {
                    let code = std::mem::take(&mut self.code);
                    if self.garbage > 0 {
                        self.garbage -= 1;
                        self.emit(b"\xfe#garbage\x04\x04>");
                        return;
                    }
                    self.emit(b"OK");
                    self.run(code);
                }
                _ => self.code.push(byte),
            },
            Mode::Paste => match byte {
                0x03 => {
                    self.interrupts += 1;
                    self.code.clear();
                    self.mode = Mode::Raw;
                    self.emit(b"\r\n");
                    self.emit(RAW_BANNER);
                }
                0x04 => {
                    let code = std::mem::take(&mut self.code);
                    self.emit(&[0x04]);
                    self.mode = Mode::Raw;
                    self.run(code);
                }
                _ => {
                    if self.credit == 0 {
                        self.overflowed = true;
                    } else {
                        self.credit -= 1;
                    }
                    self.code.push(byte);
                    self.consumed += 1;
                    if self.consumed == self.window && self.grant_credit {
                        self.consumed = 0;
                        self.credit += self.window;
                        self.emit(&[0x01]);
                    }
                }
            },
            Mode::Busy => {
                if byte == 0x03 {
                    self.interrupts += 1;
                    self.mode = Mode::Raw;
                    self.emit(
                        b"\x04Traceback (most recent call last):\r\n  File \"<stdin>\", line 1, in <module>\r\nKeyboardInterrupt: \r\n\x04>",
                    );
                }
            }
        }
    }

    fn answer_paste(&mut self) {
        match self.paste {
            PasteSupport::Window(window) => {
                self.emit(b"R\x01");
                self.emit(&window.to_le_bytes());
                self.mode = Mode::Paste;
                self.window = usize::from(window);
                self.credit = self.window;
                self.consumed = 0;
            }
            PasteSupport::Refuse => self.emit(b"R\x00"),
            PasteSupport::Legacy => self.emit(RAW_BANNER),
            PasteSupport::Silent => {}
        }
    }

    fn run(&mut self, code: Vec<u8>) {
        let code = String::from_utf8_lossy(&code).into_owned();
        self.programs.push(code.clone());
        if self.hang_on.iter().any(|needle| code.contains(needle.as_str())) {
            self.mode = Mode::Busy;
            return;
        }
        let (out, err) = self.interpret(&code);
        let mut response = out.into_bytes();
        response.push(0x04);
        response.extend_from_slice(err.as_bytes());
        response.extend_from_slice(&[0x04, b'>']);

        if let Some((marker, polls)) = self.pause.take() {
            match response.windows(marker.len()).position(|w| w == marker.as_slice()) {
                Some(at) => {
                    self.held = response.split_off(at + marker.len());
                    self.held_polls = polls;
                }
                None => self.pause = Some((marker, polls)),
            }
        }
        self.emit(&response);
    }

    /// Release held output after `held_polls` further reads.
    fn release_held(&mut self) {
        if self.held.is_empty() {
            return;
        }
        if self.held_polls == 0 {
            let held = std::mem::take(&mut self.held);
            self.outbox.extend_from_slice(&held);
        } else {
            self.held_polls -= 1;
        }
    }

    fn interpret(&mut self, code: &str) -> (String, String) {
        for caps in DEFINITION.captures_iter(code) {
            self.defined.insert(caps[1].to_string());
        }
        for handler in &self.handlers {
            if let Some(reply) = handler(code) {
                return reply;
            }
        }

        if code.contains("sys.platform") {
            let threading = if self.threading { 1 } else { 0 };
            return (format!("{}|{}\r\n", self.platform, threading), String::new());
        }
        if code.contains("gc.mem_free") {
            let ids: Vec<&str> = self.threads.iter().map(String::as_str).collect();
            return (format!("{}|51200|10240\r\n", ids.join(",")), String::new());
        }
        if code.contains("_thread.start_new_thread") {
            if !self.threading {
                return (String::new(), traceback("ImportError: no module named '_thread'"));
            }
            if let Some(caps) = THREAD_START.captures(code) {
                self.threads.insert(caps[1].to_string());
            }
            return (String::new(), String::new());
        }
        if code.contains("for _mpy_k in _mpy_threads") {
            self.threads.clear();
            return (String::new(), String::new());
        }
        if let Some(caps) = THREAD_STOP.captures(code) {
            self.threads.remove(&caps[1]);
            return (String::new(), String::new());
        }
        if let Some(caps) = INVOCATION.captures(code) {
            let symbol = &caps[1];
            if !self.defined.contains(symbol) {
                return (
                    String::new(),
                    traceback(&format!("NameError: name '{symbol}' isn't defined")),
                );
            }
            return (String::new(), String::new());
        }

        let line = code.trim();
        if line == "1/0" {
            return (String::new(), traceback("ZeroDivisionError: divide by zero"));
        }
        if let Some(caps) = PRINT_SUM.captures(line) {
            let a: i64 = caps[1].parse().unwrap();
            let b: i64 = caps[2].parse().unwrap();
            return (format!("{}\r\n", a + b), String::new());
        }
        if let Some(caps) = PRINT_TEXT.captures(line) {
            return (format!("{}\r\n", &caps[1]), String::new());
        }
        (String::new(), String::new())
    }
}

/// A traceback as the device prints it.
pub fn traceback(last_line: &str) -> String {
    format!(
        "Traceback (most recent call last):\r\n  File \"<stdin>\", line 1, in <module>\r\n{last_line}\r\n"
    )
}

/// A simulated MicroPython device.
#[derive(Clone)]
pub struct MockDevice {
    state: Arc<Mutex<State>>,
}

impl MockDevice {
    /// An `rp2` board with threading and a 128 byte raw-paste window.
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(State::new())),
        }
    }

    /// Set how the device answers the raw-paste request.
    pub fn paste(self, support: PasteSupport) -> Self {
        self.state.lock().paste = support;
        self
    }

    /// Never grant more raw-paste credit than the initial window.
    pub fn withhold_credit(self) -> Self {
        self.state.lock().grant_credit = false;
        self
    }

    /// Set what the platform probe reports.
    pub fn platform(self, platform: &str, threading: bool) -> Self {
        {
            let mut state = self.state.lock();
            state.platform = platform.to_string();
            state.threading = threading;
        }
        self
    }

    /// Answer programs for which `handler` returns `(stdout, stderr)`.
    pub fn respond<F>(&self, handler: F)
    where
        F: Fn(&str) -> Option<(String, String)> + Send + 'static,
    {
        self.state.lock().handlers.push(Box::new(handler));
    }

    /// Programs containing `needle` run until interrupted.
    pub fn hang_on(&self, needle: &str) {
        self.state.lock().hang_on.push(needle.to_string());
    }

    /// Answer the next raw-mode program with an unparseable response.
    pub fn garbage_once(&self) {
        self.state.lock().garbage += 1;
    }

    /// The next program whose output contains `marker` goes silent right
    /// after it for `polls` reads, then sends the rest.
    pub fn pause_output_once(&self, marker: &str, polls: usize) {
        self.state.lock().pause = Some((marker.as_bytes().to_vec(), polls));
    }

    /// Stop answering anything.
    pub fn set_dead(&self, dead: bool) {
        self.state.lock().dead = dead;
    }

    /// Every program the device has run, in order.
    pub fn programs(&self) -> Vec<String> {
        self.state.lock().programs.clone()
    }

    /// Programs run that contain `needle`.
    pub fn count_programs(&self, needle: &str) -> usize {
        self.state
            .lock()
            .programs
            .iter()
            .filter(|p| p.contains(needle))
            .count()
    }

    /// Number of `write` calls received.
    pub fn writes(&self) -> usize {
        self.state.lock().writes
    }

    /// Total bytes received.
    pub fn bytes_received(&self) -> usize {
        self.state.lock().bytes
    }

    /// Interrupts received.
    pub fn interrupts(&self) -> usize {
        self.state.lock().interrupts
    }

    /// Whether the host ever wrote past its raw-paste credit.
    pub fn overflowed(&self) -> bool {
        self.state.lock().overflowed
    }

    /// Sizes of the writes received in raw-paste mode.
    pub fn paste_writes(&self) -> Vec<usize> {
        self.state.lock().paste_writes.clone()
    }

    /// Functions defined on the device.
    pub fn defined(&self) -> HashSet<String> {
        self.state.lock().defined.clone()
    }

    /// Thread loops running on the device.
    pub fn threads(&self) -> Vec<String> {
        self.state.lock().threads.iter().cloned().collect()
    }

    /// End a thread loop as if it had returned by itself.
    pub fn finish_thread(&self, thread_id: &str) {
        self.state.lock().threads.remove(thread_id);
    }

    /// Whether the device sits at the normal REPL prompt.
    pub fn in_normal_mode(&self) -> bool {
        self.state.lock().mode == Mode::Normal
    }
}

impl Default for MockDevice {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for MockDevice {
    async fn open(&mut self) -> Result<()> {
        let mut state = self.state.lock();
        if !state.open {
            state.open = true;
            state.mode = Mode::Normal;
            state.emit(STARTUP);
        }
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        let mut state = self.state.lock();
        state.open = false;
        state.outbox.clear();
        state.held.clear();
        Ok(())
    }

    async fn write(&mut self, bytes: &[u8]) -> Result<()> {
        let mut state = self.state.lock();
        if !state.open {
            return Err(Error::TransportClosed);
        }
        state.writes += 1;
        state.bytes += bytes.len();
        if state.mode == Mode::Paste && bytes.first() != Some(&0x04) {
            state.paste_writes.push(bytes.len());
        }
        if state.dead {
            return Ok(());
        }
        for &byte in bytes {
            state.feed(byte);
        }
        Ok(())
    }

    async fn read_available(&mut self) -> Result<Vec<u8>> {
        let mut state = self.state.lock();
        if !state.open {
            return Err(Error::TransportClosed);
        }
        if state.dead {
            state.outbox.clear();
            return Ok(Vec::new());
        }
        state.release_held();
        Ok(std::mem::take(&mut state.outbox))
    }

    fn is_open(&self) -> bool {
        self.state.lock().open
    }
}

/// Short timeouts so failing paths finish quickly under paused time.
pub fn fast_config() -> ProtocolConfigBuilder {
    ProtocolConfig::builder()
        .base_response_timeout(Duration::from_millis(500))
        .max_response_timeout(Duration::from_secs(4))
        .handshake_timeout(Duration::from_millis(200))
        .interrupt_settle(Duration::from_millis(10))
        .poll_interval(Duration::from_millis(1))
        .retry_backoff(Duration::from_millis(10))
}

/// Connect a device over `mock` with [`fast_config`].
pub async fn connect(mock: &MockDevice) -> Device {
    connect_with(mock, fast_config().build().unwrap()).await
}

/// Connect a device over `mock` with `config`.
pub async fn connect_with(mock: &MockDevice, config: ProtocolConfig) -> Device {
    Device::builder()
        .transport(mock.clone())
        .config(config)
        .connect()
        .await
        .expect("mock device should connect")
}
