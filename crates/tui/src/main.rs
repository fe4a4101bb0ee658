//! Render queue dashboard TUI
//!
//! Terminal interface for watching and driving the 3ds Max render queue.
//! Connects to the control API at http://127.0.0.1:7979 unless
//! `MAXQUEUE_URL` or the first argument says otherwise.

use crossterm::{
    event::{self, DisableMouseCapture, EnableMouseCapture, Event, KeyCode, KeyEventKind},
    execute,
    terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen},
};
use ratatui::{
    backend::CrosstermBackend,
    layout::{Constraint, Direction, Layout, Rect},
    style::{Color, Modifier, Style},
    text::{Line, Span},
    widgets::{Block, Borders, Cell, Paragraph, Row, Table, TableState, Wrap},
    Frame, Terminal,
};
use serde::{Deserialize, Serialize};
use std::{
    collections::VecDeque,
    io::{self, Stdout},
    time::{Duration, Instant},
};

const DEFAULT_BASE_URL: &str = "http://127.0.0.1:7979";
const POLL_INTERVAL_MS: u64 = 500;
const MAX_EVENT_LOG_ENTRIES: usize = 100;

// ============================================================================
// Data Models (mirroring the daemon's queue snapshot)
// ============================================================================

/// Per-job view shown in the queue list
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobView {
    pub id: String,
    pub source: String,
    pub name: String,
    pub output_name: Option<String>,
    pub project: Option<String>,
    pub status: String,
    pub message: Option<String>,
    pub output_path: Option<String>,
}

/// One console line
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OutputEvent {
    pub job_id: Option<String>,
    pub text: String,
    pub is_error: bool,
    pub timestamp_unix_ms: i64,
}

/// Complete queue snapshot
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct QueueSnapshot {
    pub timestamp_unix_ms: i64,
    pub running: bool,
    pub active: Option<String>,
    pub jobs: Vec<JobView>,
    pub pending_jobs: usize,
    pub completed_jobs: usize,
    pub failed_jobs: usize,
    pub canceled_jobs: usize,
    pub console: Vec<OutputEvent>,
}

// ============================================================================
// Queue Editing Helpers
// ============================================================================

/// Direction to move the selected job
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Move {
    Up,
    Down,
}

/// New queue order with the job at `index` moved one step, or None at the edges.
pub fn moved_order(ids: &[String], index: usize, direction: Move) -> Option<Vec<String>> {
    let target = match direction {
        Move::Up => index.checked_sub(1)?,
        Move::Down => index + 1,
    };
    if index >= ids.len() || target >= ids.len() {
        return None;
    }
    let mut order = ids.to_vec();
    order.swap(index, target);
    Some(order)
}

/// Keep a selection inside a list of `len` rows.
pub fn clamp_selection(selected: usize, len: usize) -> usize {
    selected.min(len.saturating_sub(1))
}

fn status_color(status: &str) -> Color {
    match status {
        "active" => Color::Cyan,
        "completed" => Color::Green,
        "failed" => Color::Red,
        "canceled" => Color::DarkGray,
        _ => Color::White,
    }
}

// ============================================================================
// App State
// ============================================================================

/// Main application state for the TUI dashboard
pub struct App {
    /// Latest snapshot from the service
    pub snapshot: Option<QueueSnapshot>,
    /// Selected row in the queue table
    pub selected: usize,
    /// Results of the user's own actions
    pub event_log: VecDeque<String>,
    pub connected: bool,
    client: reqwest::Client,
    base_url: String,
}

impl App {
    pub fn new(base_url: String) -> Self {
        Self {
            snapshot: None,
            selected: 0,
            event_log: VecDeque::with_capacity(MAX_EVENT_LOG_ENTRIES),
            connected: false,
            client: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    /// Add an event to the log
    pub fn log_event(&mut self, event: String) {
        if self.event_log.len() >= MAX_EVENT_LOG_ENTRIES {
            self.event_log.pop_front();
        }
        self.event_log.push_back(event);
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn jobs(&self) -> &[JobView] {
        self.snapshot.as_ref().map(|s| s.jobs.as_slice()).unwrap_or(&[])
    }

    fn selected_job(&self) -> Option<&JobView> {
        self.jobs().get(self.selected)
    }

    pub fn select_next(&mut self) {
        self.selected = clamp_selection(self.selected + 1, self.jobs().len());
    }

    pub fn select_previous(&mut self) {
        self.selected = self.selected.saturating_sub(1);
    }

    /// Fetch the queue snapshot from the control API
    pub async fn fetch_queue(&mut self) {
        match self.client.get(self.url("/queue")).send().await {
            Ok(response) => {
                if response.status().is_success() {
                    match response.json::<QueueSnapshot>().await {
                        Ok(snapshot) => {
                            self.selected = clamp_selection(self.selected, snapshot.jobs.len());
                            self.snapshot = Some(snapshot);
                            self.connected = true;
                        }
                        Err(e) => {
                            self.log_event(format!("JSON parse error: {}", e));
                            self.connected = false;
                        }
                    }
                } else {
                    self.log_event(format!("HTTP error: {}", response.status()));
                    self.connected = false;
                }
            }
            Err(e) => {
                if self.connected {
                    self.log_event(format!("Connection lost: {}", e));
                }
                self.connected = false;
            }
        }
    }

    /// Send an action and log how it went
    async fn send_action(&mut self, label: &str, request: reqwest::RequestBuilder) {
        match request.send().await {
            Ok(response) if response.status().is_success() => {
                self.log_event(format!("{}: ok", label));
            }
            Ok(response) => {
                let status = response.status();
                let message = response
                    .json::<serde_json::Value>()
                    .await
                    .ok()
                    .and_then(|body| body["error"].as_str().map(str::to_string))
                    .unwrap_or_else(|| status.to_string());
                self.log_event(format!("{}: {}", label, message));
            }
            Err(e) => self.log_event(format!("{}: {}", label, e)),
        }
    }

    pub async fn render_all(&mut self) {
        let request = self
            .client
            .post(self.url("/render"))
            .json(&serde_json::json!({}));
        self.send_action("Render all", request).await;
    }

    pub async fn cancel_active(&mut self) {
        let Some(active) = self.snapshot.as_ref().and_then(|s| s.active.clone()) else {
            self.log_event("Nothing is rendering".to_string());
            return;
        };
        let request = self.client.post(self.url(&format!("/jobs/{}/cancel", active)));
        self.send_action("Cancel", request).await;
    }

    pub async fn remove_selected(&mut self) {
        let Some(id) = self.selected_job().map(|j| j.id.clone()) else {
            return;
        };
        let request = self.client.delete(self.url(&format!("/jobs/{}", id)));
        self.send_action("Remove", request).await;
    }

    pub async fn move_selected(&mut self, direction: Move) {
        let ids: Vec<String> = self.jobs().iter().map(|j| j.id.clone()).collect();
        let Some(order) = moved_order(&ids, self.selected, direction) else {
            return;
        };
        let request = self
            .client
            .put(self.url("/queue/order"))
            .json(&serde_json::json!({ "ids": order }));
        self.send_action("Reorder", request).await;
        match direction {
            Move::Up => self.select_previous(),
            Move::Down => self.select_next(),
        }
    }

    pub async fn clear_queue(&mut self) {
        let request = self.client.delete(self.url("/queue"));
        self.send_action("Clear queue", request).await;
    }

    pub async fn open_output_folder(&mut self) {
        let request = self
            .client
            .post(self.url("/open-folder"))
            .json(&serde_json::json!({}));
        self.send_action("Open output folder", request).await;
    }
}

// ============================================================================
// Terminal Setup/Teardown
// ============================================================================

/// Initialize the terminal for TUI rendering
fn setup_terminal() -> io::Result<Terminal<CrosstermBackend<Stdout>>> {
    enable_raw_mode()?;
    let mut stdout = io::stdout();
    execute!(stdout, EnterAlternateScreen, EnableMouseCapture)?;
    let backend = CrosstermBackend::new(stdout);
    Terminal::new(backend)
}

/// Restore terminal to normal state
fn restore_terminal(terminal: &mut Terminal<CrosstermBackend<Stdout>>) -> io::Result<()> {
    disable_raw_mode()?;
    execute!(
        terminal.backend_mut(),
        LeaveAlternateScreen,
        DisableMouseCapture
    )?;
    terminal.show_cursor()?;
    Ok(())
}

// ============================================================================
// Widget Rendering
// ============================================================================

/// Render the queue table
fn render_queue_table(f: &mut Frame, area: Rect, app: &App) {
    let header_cells = ["#", "Scene", "Status", "Project", "Output / Message"]
        .iter()
        .map(|h| Cell::from(*h).style(Style::default().fg(Color::Yellow).add_modifier(Modifier::BOLD)));
    let header = Row::new(header_cells).height(1).bottom_margin(1);

    let rows: Vec<Row> = app
        .jobs()
        .iter()
        .enumerate()
        .map(|(i, job)| {
            let detail = job
                .message
                .clone()
                .or_else(|| job.output_path.clone())
                .unwrap_or_default();
            Row::new(vec![
                Cell::from(format!("{}", i + 1)),
                Cell::from(job.name.clone()),
                Cell::from(job.status.clone()).style(Style::default().fg(status_color(&job.status))),
                Cell::from(job.project.clone().unwrap_or_else(|| "-".to_string())),
                Cell::from(detail),
            ])
        })
        .collect();

    let widths = [
        Constraint::Length(4),
        Constraint::Percentage(30),
        Constraint::Length(10),
        Constraint::Length(14),
        Constraint::Min(10),
    ];

    let title = if app.connected {
        " Render Queue "
    } else {
        " Render Queue (Disconnected) "
    };

    let table = Table::new(rows, widths)
        .header(header)
        .block(Block::default().borders(Borders::ALL).title(title))
        .highlight_style(Style::default().add_modifier(Modifier::REVERSED));

    let mut state = TableState::default();
    if !app.jobs().is_empty() {
        state.select(Some(app.selected));
    }
    f.render_stateful_widget(table, area, &mut state);
}

/// Render the renderer console, newest line at the bottom
fn render_console(f: &mut Frame, area: Rect, app: &App) {
    let visible = area.height.saturating_sub(2) as usize;
    let console = app
        .snapshot
        .as_ref()
        .map(|s| s.console.as_slice())
        .unwrap_or(&[]);

    let lines: Vec<Line> = console
        .iter()
        .skip(console.len().saturating_sub(visible))
        .map(|e| {
            let style = if e.is_error {
                Style::default().fg(Color::Red)
            } else {
                Style::default()
            };
            Line::from(Span::styled(e.text.clone(), style))
        })
        .collect();

    let paragraph = Paragraph::new(lines)
        .block(Block::default().borders(Borders::ALL).title(" Console "))
        .wrap(Wrap { trim: true });

    f.render_widget(paragraph, area);
}

/// Render event log showing the results of key presses
fn render_event_log(f: &mut Frame, area: Rect, app: &App) {
    let events: Vec<Line> = app
        .event_log
        .iter()
        .rev()
        .take(area.height.saturating_sub(2) as usize)
        .map(|e| Line::from(e.as_str()))
        .collect();

    let paragraph = Paragraph::new(events)
        .block(Block::default().borders(Borders::ALL).title(" Actions "))
        .wrap(Wrap { trim: true });

    f.render_widget(paragraph, area);
}

/// Render status bar with counters and key help
fn render_status_bar(f: &mut Frame, area: Rect, app: &App) {
    let status = if let Some(ref snapshot) = app.snapshot {
        format!(
            " {} | Pending: {} | Completed: {} | Failed: {} | Canceled: {} | r render  c cancel  d remove  K/J move  x clear  o open  q quit ",
            if snapshot.running { "Rendering" } else { "Idle" },
            snapshot.pending_jobs,
            snapshot.completed_jobs,
            snapshot.failed_jobs,
            snapshot.canceled_jobs,
        )
    } else {
        " Connecting to render queue... | Press 'q' to quit ".to_string()
    };

    let paragraph = Paragraph::new(status)
        .style(Style::default().fg(Color::White).bg(Color::DarkGray));

    f.render_widget(paragraph, area);
}

// ============================================================================
// Main UI Layout
// ============================================================================

/// Render the complete UI layout
fn ui(f: &mut Frame, app: &App) {
    let size = f.area();

    // Main layout: status bar at bottom, rest for content
    let main_chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([Constraint::Min(0), Constraint::Length(1)])
        .split(size);

    // Queue on top, console and action log below
    let content_chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([Constraint::Percentage(50), Constraint::Percentage(50)])
        .split(main_chunks[0]);

    let bottom_chunks = Layout::default()
        .direction(Direction::Horizontal)
        .constraints([Constraint::Percentage(70), Constraint::Percentage(30)])
        .split(content_chunks[1]);

    render_queue_table(f, content_chunks[0], app);
    render_console(f, bottom_chunks[0], app);
    render_event_log(f, bottom_chunks[1], app);
    render_status_bar(f, main_chunks[1], app);
}

// ============================================================================
// Main Entry Point
// ============================================================================

#[tokio::main]
async fn main() -> io::Result<()> {
    let base_url = std::env::args()
        .nth(1)
        .or_else(|| std::env::var("MAXQUEUE_URL").ok())
        .unwrap_or_else(|| DEFAULT_BASE_URL.to_string());

    let mut terminal = setup_terminal()?;

    let mut app = App::new(base_url);
    app.log_event("Render queue dashboard started".to_string());

    let result = run_app(&mut terminal, &mut app).await;

    restore_terminal(&mut terminal)?;

    result
}

/// Main application loop
async fn run_app(
    terminal: &mut Terminal<CrosstermBackend<Stdout>>,
    app: &mut App,
) -> io::Result<()> {
    let poll_interval = Duration::from_millis(POLL_INTERVAL_MS);
    let mut last_fetch = Instant::now() - poll_interval; // Fetch immediately on start

    loop {
        if last_fetch.elapsed() >= poll_interval {
            app.fetch_queue().await;
            last_fetch = Instant::now();
        }

        terminal.draw(|f| ui(f, app))?;

        // Handle input with a short timeout to allow frequent redraws
        if event::poll(Duration::from_millis(50))? {
            if let Event::Key(key) = event::read()? {
                if key.kind != KeyEventKind::Press {
                    continue;
                }
                let acted = match key.code {
                    KeyCode::Char('q') | KeyCode::Esc => return Ok(()),
                    KeyCode::Up | KeyCode::Char('k') => {
                        app.select_previous();
                        false
                    }
                    KeyCode::Down | KeyCode::Char('j') => {
                        app.select_next();
                        false
                    }
                    KeyCode::Char('r') => {
                        app.render_all().await;
                        true
                    }
                    KeyCode::Char('c') => {
                        app.cancel_active().await;
                        true
                    }
                    KeyCode::Char('d') => {
                        app.remove_selected().await;
                        true
                    }
                    KeyCode::Char('K') => {
                        app.move_selected(Move::Up).await;
                        true
                    }
                    KeyCode::Char('J') => {
                        app.move_selected(Move::Down).await;
                        true
                    }
                    KeyCode::Char('x') => {
                        app.clear_queue().await;
                        true
                    }
                    KeyCode::Char('o') => {
                        app.open_output_folder().await;
                        true
                    }
                    _ => false,
                };
                // Show the effect of an action without waiting for the next poll
                if acted {
                    app.fetch_queue().await;
                    last_fetch = Instant::now();
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn ids(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("job-{}", i)).collect()
    }

    #[test]
    fn test_moved_order_edges() {
        let order = ids(3);
        assert_eq!(moved_order(&order, 0, Move::Up), None);
        assert_eq!(moved_order(&order, 2, Move::Down), None);
        assert_eq!(moved_order(&order, 5, Move::Up), None);
        assert_eq!(
            moved_order(&order, 1, Move::Up),
            Some(vec!["job-1".to_string(), "job-0".to_string(), "job-2".to_string()])
        );
    }

    #[test]
    fn test_clamp_selection() {
        assert_eq!(clamp_selection(4, 3), 2);
        assert_eq!(clamp_selection(1, 3), 1);
        assert_eq!(clamp_selection(7, 0), 0);
    }

    #[test]
    fn test_snapshot_from_daemon_json() {
        let json = r#"{
            "timestamp_unix_ms": 1760000000000,
            "running": true,
            "active": "7f1c2a9e-4a43-4c1b-9a53-0d7c3f1a2b3c",
            "jobs": [{
                "id": "7f1c2a9e-4a43-4c1b-9a53-0d7c3f1a2b3c",
                "source": "C:/scenes/villa.max",
                "name": "villa.max",
                "output_name": null,
                "project": "Villa",
                "status": "active",
                "message": null,
                "output_path": "C:/Renders/Villa/villa.jpg"
            }],
            "pending_jobs": 0,
            "completed_jobs": 0,
            "failed_jobs": 0,
            "canceled_jobs": 0,
            "console": [{
                "job_id": null,
                "text": "Starting render queue...",
                "is_error": false,
                "timestamp_unix_ms": 1760000000000
            }]
        }"#;

        let snapshot: QueueSnapshot = serde_json::from_str(json).unwrap();
        assert!(snapshot.running);
        assert_eq!(snapshot.jobs[0].status, "active");
        assert_eq!(snapshot.jobs[0].project.as_deref(), Some("Villa"));
        assert_eq!(snapshot.console[0].text, "Starting render queue...");
        assert_eq!(status_color(&snapshot.jobs[0].status), Color::Cyan);
    }

    #[test]
    fn test_app_selection_follows_jobs() {
        let mut app = App::new("http://127.0.0.1:7979/".to_string());
        assert_eq!(app.url("/queue"), "http://127.0.0.1:7979/queue");

        app.select_next();
        assert_eq!(app.selected, 0);

        app.snapshot = Some(QueueSnapshot {
            jobs: ids(2)
                .into_iter()
                .map(|id| JobView {
                    id,
                    source: "a.max".to_string(),
                    name: "a.max".to_string(),
                    output_name: None,
                    project: None,
                    status: "pending".to_string(),
                    message: None,
                    output_path: None,
                })
                .collect(),
            ..QueueSnapshot::default()
        });
        app.select_next();
        app.select_next();
        assert_eq!(app.selected, 1);
        app.select_previous();
        assert_eq!(app.selected, 0);
    }

    // Moving a job keeps every job exactly once and swaps only the neighbours.
    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn prop_moved_order_is_adjacent_swap(len in 1usize..20, index in 0usize..20, up in any::<bool>()) {
            let order = ids(len);
            let direction = if up { Move::Up } else { Move::Down };

            match moved_order(&order, index, direction) {
                Some(moved) => {
                    let mut sorted = moved.clone();
                    sorted.sort();
                    let mut expected = order.clone();
                    expected.sort();
                    prop_assert_eq!(sorted, expected);

                    let other = if up { index - 1 } else { index + 1 };
                    prop_assert_eq!(&moved[other], &order[index]);
                    prop_assert_eq!(&moved[index], &order[other]);
                }
                None => {
                    prop_assert!(index >= len || (up && index == 0) || (!up && index + 1 >= len));
                }
            }
        }
    }
}
