//! Pumptrack TUI - Operator dashboard for the lap timer
//!
//! Subscribes to the timer's MQTT topics and displays:
//! - Race state, running lap time and reset countdown
//! - Recent laps and DNFs
//! - Session statistics (best, average, completion rate)
//! - Sensor health (distance, signal strength, temperature)
//!
//! Keys send operator commands through the HTTP API:
//! s = start, x = stop, r = reset, a = abort lap, q = quit

use clap::Parser;
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
    widgets::{Block, Borders, Gauge, List, ListItem, Paragraph},
    Frame, Terminal,
};
use rumqttc::{AsyncClient, Event as MqttEvent, MqttOptions, Packet, QoS};
use serde::Deserialize;
use std::collections::VecDeque;
use std::io;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

/// Maximum laps to keep in history
const MAX_LAPS: usize = 12;

#[derive(Parser, Debug)]
#[command(name = "pumptrack-tui", about = "Operator dashboard for the pumptrack timer")]
struct Args {
    /// MQTT broker host
    #[arg(long, default_value = "localhost")]
    mqtt_host: String,

    #[arg(long, default_value_t = 1883)]
    mqtt_port: u16,

    #[arg(long)]
    mqtt_username: Option<String>,

    #[arg(long)]
    mqtt_password: Option<String>,

    /// Base URL of the timer's HTTP API
    #[arg(long, default_value = "http://localhost:8080")]
    api: String,

    /// Topic prefix the timer publishes under
    #[arg(long, default_value = "pumptrack")]
    prefix: String,
}

/// Lap from the lap and dnf topics
#[derive(Debug, Clone, Deserialize)]
struct Lap {
    lap_number: usize,
    duration: f64,
    status: String,
    timestamp: String,
}

/// Status from the status topic
#[derive(Debug, Clone, Deserialize, Default)]
struct Status {
    race_state: String,
    state_label: String,
    sensor_health: String,
    current_lap_time: Option<f64>,
    reset_remaining: Option<f64>,
    last_lap_time: Option<f64>,
    total_laps: usize,
    total_dnf: usize,
}

/// Statistics from the stats topic
#[derive(Debug, Clone, Deserialize, Default)]
struct Statistics {
    count: usize,
    average: Option<f64>,
    best: Option<f64>,
    total_attempts: usize,
    completion_rate: f64,
    total_race_time: f64,
}

/// Sensor detail from the health topic
#[derive(Debug, Clone, Deserialize, Default)]
struct Health {
    sensor_health: String,
    distance_cm: Option<f64>,
    signal_strength: Option<u16>,
    temperature_c: Option<f64>,
    invalid_streak: u32,
}

/// Dashboard state shared between MQTT handler and UI
#[derive(Debug, Default)]
struct DashboardState {
    status: Status,
    status_received: Option<Instant>,
    stats: Statistics,
    health: Health,
    laps: VecDeque<Lap>,

    // Last command result line
    last_command: Option<String>,

    // Connection status
    connected: bool,
    last_message: Option<Instant>,
}

impl DashboardState {
    fn handle_lap(&mut self, lap: Lap) {
        self.laps.push_front(lap);
        if self.laps.len() > MAX_LAPS {
            self.laps.pop_back();
        }
    }

    /// Running lap time extrapolated from the last status message
    fn current_lap_time(&self) -> Option<f64> {
        let base = self.status.current_lap_time?;
        let age = self.status_received.map_or(0.0, |at| at.elapsed().as_secs_f64());
        Some(base + age)
    }

    fn reset_remaining(&self) -> Option<f64> {
        let base = self.status.reset_remaining?;
        let age = self.status_received.map_or(0.0, |at| at.elapsed().as_secs_f64());
        Some((base - age).max(0.0))
    }
}

type SharedState = Arc<Mutex<DashboardState>>;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    enable_raw_mode()?;
    let mut stdout = io::stdout();
    execute!(stdout, EnterAlternateScreen, EnableMouseCapture)?;
    let backend = CrosstermBackend::new(stdout);
    let mut terminal = Terminal::new(backend)?;

    let state: SharedState = Arc::new(Mutex::new(DashboardState::default()));

    let mqtt_state = state.clone();
    let mqtt_args = (
        args.mqtt_host.clone(),
        args.mqtt_port,
        args.mqtt_username.clone(),
        args.mqtt_password.clone(),
        args.prefix.clone(),
    );
    let mqtt_handle = tokio::spawn(async move {
        let (host, port, user, pass, prefix) = mqtt_args;
        run_mqtt_subscriber(&host, port, user, pass, &prefix, mqtt_state).await;
    });

    let http = reqwest::Client::builder().timeout(Duration::from_secs(2)).build()?;
    let result = run_ui(&mut terminal, state, &http, &args.api).await;

    mqtt_handle.abort();
    disable_raw_mode()?;
    execute!(terminal.backend_mut(), LeaveAlternateScreen, DisableMouseCapture)?;
    terminal.show_cursor()?;

    result
}

async fn run_mqtt_subscriber(
    host: &str,
    port: u16,
    username: Option<String>,
    password: Option<String>,
    prefix: &str,
    state: SharedState,
) {
    let client_id = format!("pumptrack-tui-{}", std::process::id());
    let mut mqttoptions = MqttOptions::new(client_id, host, port);
    mqttoptions.set_keep_alive(Duration::from_secs(30));
    mqttoptions.set_clean_session(true);

    if let (Some(user), Some(pass)) = (username, password) {
        mqttoptions.set_credentials(user, pass);
    }

    let (client, mut eventloop) = AsyncClient::new(mqttoptions, 100);
    let _ = client.subscribe(format!("{prefix}/#"), QoS::AtMostOnce).await;

    loop {
        match eventloop.poll().await {
            Ok(MqttEvent::Incoming(Packet::ConnAck(_))) => {
                state.lock().await.connected = true;
            }
            Ok(MqttEvent::Incoming(Packet::Publish(publish))) => {
                let kind = publish.topic.rsplit('/').next().unwrap_or("");
                let payload = std::str::from_utf8(&publish.payload).unwrap_or("");

                let mut s = state.lock().await;
                match kind {
                    "lap" | "dnf" => {
                        if let Ok(lap) = serde_json::from_str::<Lap>(payload) {
                            s.handle_lap(lap);
                        }
                    }
                    "status" => {
                        if let Ok(status) = serde_json::from_str::<Status>(payload) {
                            s.status = status;
                            s.status_received = Some(Instant::now());
                        }
                    }
                    "stats" => {
                        if let Ok(stats) = serde_json::from_str::<Statistics>(payload) {
                            s.stats = stats;
                        }
                    }
                    "health" => {
                        if let Ok(health) = serde_json::from_str::<Health>(payload) {
                            s.health = health;
                        }
                    }
                    _ => {}
                }
                s.last_message = Some(Instant::now());
            }
            Ok(_) => {}
            Err(_) => {
                state.lock().await.connected = false;
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }
    }
}

async fn send_command(http: &reqwest::Client, api: &str, command: &str) -> String {
    let url = format!("{}/api/{command}", api.trim_end_matches('/'));
    match http.post(&url).send().await {
        Ok(response) if response.status().is_success() => format!("{command}: queued"),
        Ok(response) => format!("{command}: rejected ({})", response.status()),
        Err(e) => format!("{command}: failed ({e})"),
    }
}

async fn run_ui(
    terminal: &mut Terminal<CrosstermBackend<io::Stdout>>,
    state: SharedState,
    http: &reqwest::Client,
    api: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let tick_rate = Duration::from_millis(100);
    let mut last_tick = Instant::now();

    loop {
        let s = state.lock().await;
        terminal.draw(|f| draw_ui(f, &s))?;
        drop(s);

        let timeout = tick_rate.saturating_sub(last_tick.elapsed());
        if event::poll(timeout)? {
            if let Event::Key(key) = event::read()? {
                if key.kind == KeyEventKind::Press {
                    let command = match key.code {
                        KeyCode::Char('q') | KeyCode::Esc => return Ok(()),
                        KeyCode::Char('s') => Some("start"),
                        KeyCode::Char('x') => Some("stop"),
                        KeyCode::Char('r') => Some("reset"),
                        KeyCode::Char('a') => Some("abort"),
                        _ => None,
                    };
                    if let Some(command) = command {
                        let result = send_command(http, api, command).await;
                        state.lock().await.last_command = Some(result);
                    }
                }
            }
        }

        if last_tick.elapsed() >= tick_rate {
            last_tick = Instant::now();
        }
    }
}

fn draw_ui(f: &mut Frame, state: &DashboardState) {
    let main_chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Length(3), // Header
            Constraint::Length(7), // Race
            Constraint::Min(0),    // Bottom panels
            Constraint::Length(1), // Key help
        ])
        .split(f.area());

    draw_header(f, main_chunks[0], state);
    draw_race_panel(f, main_chunks[1], state);

    let bottom = Layout::default()
        .direction(Direction::Horizontal)
        .constraints([Constraint::Percentage(50), Constraint::Percentage(50)])
        .split(main_chunks[2]);
    draw_laps_panel(f, bottom[0], state);

    let right = Layout::default()
        .direction(Direction::Vertical)
        .constraints([Constraint::Min(0), Constraint::Length(7)])
        .split(bottom[1]);
    draw_stats_panel(f, right[0], state);
    draw_sensor_panel(f, right[1], state);

    let help = Line::from(vec![
        Span::styled(" s", Style::default().fg(Color::Cyan)),
        Span::raw(" start  "),
        Span::styled("x", Style::default().fg(Color::Cyan)),
        Span::raw(" stop  "),
        Span::styled("r", Style::default().fg(Color::Cyan)),
        Span::raw(" reset  "),
        Span::styled("a", Style::default().fg(Color::Cyan)),
        Span::raw(" abort lap  "),
        Span::styled("q", Style::default().fg(Color::Cyan)),
        Span::raw(" quit   "),
        Span::styled(
            state.last_command.clone().unwrap_or_default(),
            Style::default().fg(Color::DarkGray),
        ),
    ]);
    f.render_widget(Paragraph::new(help), main_chunks[3]);
}

fn draw_header(f: &mut Frame, area: Rect, state: &DashboardState) {
    let (conn_text, conn_color) =
        if state.connected { ("CONNECTED", Color::Green) } else { ("DISCONNECTED", Color::Red) };
    let last_msg = state
        .last_message
        .map(|t| format!("{:.1}s ago", t.elapsed().as_secs_f64()))
        .unwrap_or_else(|| "never".to_string());

    let header = Paragraph::new(Line::from(vec![
        Span::styled(" PUMPTRACK TIMER ", Style::default().fg(Color::Cyan).add_modifier(Modifier::BOLD)),
        Span::raw(" | "),
        Span::styled(conn_text, Style::default().fg(conn_color)),
        Span::raw(format!(" | last message {last_msg}")),
    ]))
    .block(Block::default().borders(Borders::ALL));

    f.render_widget(header, area);
}

fn state_color(race_state: &str) -> Color {
    match race_state {
        "ready" => Color::Green,
        "timing" => Color::Blue,
        "completed" => Color::Green,
        "dnf" => Color::Red,
        "reset_countdown" => Color::Yellow,
        _ => Color::Gray,
    }
}

fn draw_race_panel(f: &mut Frame, area: Rect, state: &DashboardState) {
    let status = &state.status;
    let color = state_color(&status.race_state);
    let label = if status.state_label.is_empty() { "-" } else { status.state_label.as_str() };

    let mut lines = vec![Line::from(Span::styled(
        label.to_uppercase(),
        Style::default().fg(color).add_modifier(Modifier::BOLD),
    ))];

    if let Some(t) = state.current_lap_time() {
        lines.push(Line::from(Span::styled(
            format!("{t:>8.2}s"),
            Style::default().fg(Color::White).add_modifier(Modifier::BOLD),
        )));
    } else if let Some(remaining) = state.reset_remaining() {
        lines.push(Line::from(format!("Next rider in {remaining:.1}s")));
    }

    if let Some(last) = status.last_lap_time {
        lines.push(Line::from(format!("Last lap: {last:.2}s")));
    }
    lines.push(Line::from(format!("Laps: {}  DNF: {}", status.total_laps, status.total_dnf)));

    let race = Paragraph::new(lines).block(
        Block::default()
            .title(" Race ")
            .borders(Borders::ALL)
            .border_style(Style::default().fg(color)),
    );
    f.render_widget(race, area);
}

fn draw_laps_panel(f: &mut Frame, area: Rect, state: &DashboardState) {
    let best = state.stats.best;
    let items: Vec<ListItem> = state
        .laps
        .iter()
        .map(|lap| {
            let (text, color) = if lap.status == "dnf" {
                ("DNF".to_string(), Color::Red)
            } else if best.is_some_and(|b| (b - lap.duration).abs() < 0.0005) {
                (format!("{:.2}s *", lap.duration), Color::Magenta)
            } else {
                (format!("{:.2}s", lap.duration), Color::Green)
            };
            let time = lap.timestamp.get(11..19).unwrap_or("");
            ListItem::new(Line::from(vec![
                Span::raw(format!("#{:<4}", lap.lap_number)),
                Span::styled(format!("{text:<10}"), Style::default().fg(color)),
                Span::styled(time.to_string(), Style::default().fg(Color::DarkGray)),
            ]))
        })
        .collect();

    let list = List::new(items).block(
        Block::default()
            .title(" Laps ")
            .borders(Borders::ALL)
            .border_style(Style::default().fg(Color::Cyan)),
    );
    f.render_widget(list, area);
}

fn draw_stats_panel(f: &mut Frame, area: Rect, state: &DashboardState) {
    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([Constraint::Length(3), Constraint::Min(0)])
        .split(area);

    let rate = state.stats.completion_rate;
    let rate_color = if rate >= 80.0 {
        Color::Green
    } else if rate >= 50.0 {
        Color::Yellow
    } else {
        Color::Red
    };
    let gauge = Gauge::default()
        .block(Block::default().title(" Completion ").borders(Borders::ALL))
        .gauge_style(Style::default().fg(rate_color))
        .ratio((rate / 100.0).clamp(0.0, 1.0))
        .label(format!("{rate:.0}%"));
    f.render_widget(gauge, chunks[0]);

    let fmt = |v: Option<f64>| v.map(|s| format!("{s:.2}s")).unwrap_or_else(|| "-".to_string());
    let stats = Paragraph::new(vec![
        Line::from(format!("Best:      {}", fmt(state.stats.best))),
        Line::from(format!("Average:   {}", fmt(state.stats.average))),
        Line::from(format!("Completed: {}/{}", state.stats.count, state.stats.total_attempts)),
        Line::from(format!("Ride time: {:.1}s", state.stats.total_race_time)),
    ])
    .block(
        Block::default()
            .title(" Statistics ")
            .borders(Borders::ALL)
            .border_style(Style::default().fg(Color::Green)),
    );
    f.render_widget(stats, chunks[1]);
}

fn draw_sensor_panel(f: &mut Frame, area: Rect, state: &DashboardState) {
    let health = &state.health;
    let health_text = if health.sensor_health.is_empty() {
        state.status.sensor_health.as_str()
    } else {
        health.sensor_health.as_str()
    };
    let color = match health_text {
        "healthy" => Color::Green,
        "degraded" => Color::Red,
        _ => Color::Gray,
    };

    let opt = |v: Option<String>| v.unwrap_or_else(|| "-".to_string());
    let sensor = Paragraph::new(vec![
        Line::from(Span::styled(health_text.to_uppercase(), Style::default().fg(color))),
        Line::from(format!("Distance:  {} cm", opt(health.distance_cm.map(|d| format!("{d:.0}"))))),
        Line::from(format!("Strength:  {}", opt(health.signal_strength.map(|s| s.to_string())))),
        Line::from(format!(
            "Temp:      {} C   invalid streak {}",
            opt(health.temperature_c.map(|t| format!("{t:.1}"))),
            health.invalid_streak
        )),
    ])
    .block(
        Block::default()
            .title(" Sensor ")
            .borders(Borders::ALL)
            .border_style(Style::default().fg(color)),
    );
    f.render_widget(sensor, area);
}
