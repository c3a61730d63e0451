use anyhow::{Context, Result};
use clap::Parser;
use crossterm::event::{Event, KeyCode, KeyEventKind};
use transcoder::{
    config::TranscodeConfig,
    control::{write_command, ControlCommand},
    job::{Job, JobStatus},
    snapshot::{load_snapshot, Snapshot},
};
use ratatui::{
    backend::{Backend, CrosstermBackend},
    layout::{Constraint, Direction, Layout, Rect},
    style::{Color, Modifier, Style},
    widgets::{Block, Borders, Gauge, Paragraph, Row, Table, TableState},
    Frame, Terminal,
};
use std::io::stdout;
use std::path::PathBuf;
use std::time::Duration;
use sysinfo::System;
use humansize::{format_size, DECIMAL};

struct App {
    snapshot: Option<Snapshot>,
    system: System,
    table_state: TableState,
    should_quit: bool,
    snapshot_path: PathBuf,
    command_dir: PathBuf,
    /// Feedback from the last key action
    message: Option<String>,
}

impl App {
    fn new(snapshot_path: PathBuf, command_dir: PathBuf) -> Self {
        Self {
            snapshot: None,
            system: System::new(),
            table_state: TableState::default(),
            should_quit: false,
            snapshot_path,
            command_dir,
            message: None,
        }
    }

    fn refresh(&mut self) {
        self.system.refresh_all();

        // A missing snapshot just means the daemon is not running yet
        self.snapshot = load_snapshot(&self.snapshot_path).ok();

        let len = self.jobs().len();
        match self.table_state.selected() {
            _ if len == 0 => self.table_state.select(None),
            Some(i) if i >= len => self.table_state.select(Some(len - 1)),
            None => self.table_state.select(Some(0)),
            _ => {}
        }
    }

    fn jobs(&self) -> &[Job] {
        self.snapshot.as_ref().map(|s| s.jobs.as_slice()).unwrap_or(&[])
    }

    fn cap(&self) -> usize {
        self.snapshot.as_ref().map(|s| s.max_concurrent_jobs).unwrap_or(1)
    }

    fn count_by_status(&self, status: JobStatus) -> usize {
        self.jobs().iter().filter(|j| j.status == status).count()
    }

    fn selected_job(&self) -> Option<&Job> {
        self.table_state.selected().and_then(|i| self.jobs().get(i))
    }

    fn move_selection(&mut self, delta: isize) {
        let len = self.jobs().len();
        if len == 0 {
            return;
        }
        let current = self.table_state.selected().unwrap_or(0) as isize;
        let next = (current + delta).clamp(0, len as isize - 1);
        self.table_state.select(Some(next as usize));
    }

    fn send(&mut self, command: ControlCommand, description: String) {
        self.message = Some(match write_command(&self.command_dir, &command) {
            Ok(_) => format!("Sent: {}", description),
            Err(e) => format!("Failed to send {}: {:#}", description, e),
        });
    }

    fn handle_key(&mut self, code: KeyCode) {
        match code {
            KeyCode::Char('q') => self.should_quit = true,
            KeyCode::Up => self.move_selection(-1),
            KeyCode::Down => self.move_selection(1),
            KeyCode::Char('c') => {
                if let Some(job) = self.selected_job() {
                    let (job_id, name) = (job.id.clone(), job.file_name());
                    self.send(ControlCommand::Cancel { job_id }, format!("cancel {}", name));
                }
            }
            KeyCode::Char('C') => self.send(ControlCommand::CancelAll, "cancel all".to_string()),
            KeyCode::Char('r') => self.send(ControlCommand::RetryAll, "retry all".to_string()),
            KeyCode::Char('+') => {
                let cap = self.cap() + 1;
                self.send(
                    ControlCommand::SetConcurrency { max_concurrent_jobs: cap },
                    format!("concurrency {}", cap),
                );
            }
            KeyCode::Char('-') => {
                let cap = self.cap().saturating_sub(1).max(1);
                self.send(
                    ControlCommand::SetConcurrency { max_concurrent_jobs: cap },
                    format!("concurrency {}", cap),
                );
            }
            _ => {}
        }
    }
}

fn main() -> Result<()> {
    let args = Args::parse();

    let cfg = TranscodeConfig::load_config(args.config.as_deref())
        .context("Failed to load configuration")?;

    // Setup terminal
    crossterm::terminal::enable_raw_mode()?;
    let mut stdout = stdout();
    crossterm::execute!(stdout, crossterm::terminal::EnterAlternateScreen)?;
    let backend = CrosstermBackend::new(stdout);
    let mut terminal = Terminal::new(backend)?;

    let mut app = App::new(cfg.snapshot_path(), cfg.command_dir());
    let result = run(&mut terminal, &mut app);

    // Restore terminal
    crossterm::terminal::disable_raw_mode()?;
    crossterm::execute!(
        terminal.backend_mut(),
        crossterm::terminal::LeaveAlternateScreen
    )?;

    result
}

fn run<B: Backend>(terminal: &mut Terminal<B>, app: &mut App) -> Result<()> {
    loop {
        app.refresh();
        terminal.draw(|f| ui(f, app))?;

        if crossterm::event::poll(Duration::from_millis(250))? {
            if let Event::Key(key) = crossterm::event::read()? {
                if key.kind == KeyEventKind::Press {
                    app.handle_key(key.code);
                }
            }
        }

        if app.should_quit {
            return Ok(());
        }
    }
}

/// Transcode daemon monitor
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file (JSON or TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,
}

fn ui(f: &mut Frame, app: &mut App) {
    let size = f.size();

    if size.height < 10 || size.width < 80 {
        let error_msg = Paragraph::new("Terminal too small! Please resize to at least 80x10.")
            .block(Block::default().borders(Borders::ALL).title("Error"))
            .style(Style::default().fg(Color::Red));
        f.render_widget(error_msg, size);
        return;
    }

    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Length(3), // CPU / memory / slots
            Constraint::Min(3),    // jobs
            Constraint::Length(3), // status
        ])
        .split(size);

    render_top_bar(f, app, chunks[0]);
    render_job_table(f, app, chunks[1]);
    render_status_bar(f, app, chunks[2]);
}

fn render_top_bar(f: &mut Frame, app: &App, area: Rect) {
    let chunks = Layout::default()
        .direction(Direction::Horizontal)
        .constraints([
            Constraint::Percentage(33),
            Constraint::Percentage(34),
            Constraint::Percentage(33),
        ])
        .split(area);

    let cpu_usage = clamp_percent(app.system.global_cpu_usage() as f64);
    let cpu_gauge = Gauge::default()
        .block(Block::default().borders(Borders::ALL).title("CPU"))
        .gauge_style(Style::default().fg(Color::Cyan))
        .percent(cpu_usage as u16)
        .label(format!("{:.1}%", cpu_usage));
    f.render_widget(cpu_gauge, chunks[0]);

    let total_memory = app.system.total_memory();
    let memory_percent = if total_memory == 0 {
        0.0
    } else {
        clamp_percent(app.system.used_memory() as f64 / total_memory as f64 * 100.0)
    };
    let memory_gauge = Gauge::default()
        .block(Block::default().borders(Borders::ALL).title("Memory"))
        .gauge_style(Style::default().fg(Color::Green))
        .percent(memory_percent as u16)
        .label(format!("{:.1}%", memory_percent));
    f.render_widget(memory_gauge, chunks[1]);

    let running = app.count_by_status(JobStatus::Running);
    let cap = app.cap();
    let slots_gauge = Gauge::default()
        .block(Block::default().borders(Borders::ALL).title("Slots"))
        .gauge_style(Style::default().fg(Color::Magenta))
        .percent(clamp_percent(running as f64 / cap.max(1) as f64 * 100.0) as u16)
        .label(format!("{}/{} running", running, cap));
    f.render_widget(slots_gauge, chunks[2]);
}

fn render_job_table(f: &mut Frame, app: &mut App, area: Rect) {
    let header = Row::new(vec!["ST", "FILE", "PROGRESS", "ORIG", "NEW", "RATIO", "TIME", "ERROR"])
        .style(Style::default().add_modifier(Modifier::BOLD))
        .height(1);

    let rows: Vec<Row> = if app.jobs().is_empty() {
        let note = if app.snapshot.is_some() {
            "No jobs".to_string()
        } else {
            format!("No snapshot at {}", app.snapshot_path.display())
        };
        vec![Row::new(vec!["-".to_string(), note])]
    } else {
        app.jobs().iter().map(job_row).collect()
    };

    let widths = [
        Constraint::Length(5),
        Constraint::Percentage(30),
        Constraint::Length(18),
        Constraint::Length(9),
        Constraint::Length(9),
        Constraint::Length(6),
        Constraint::Length(9),
        Constraint::Percentage(30),
    ];

    let title = format!("Jobs ({})", app.jobs().len());
    let table = Table::new(rows, widths)
        .header(header)
        .block(Block::default().borders(Borders::ALL).title(title))
        .highlight_style(Style::default().add_modifier(Modifier::REVERSED))
        .column_spacing(1);

    f.render_stateful_widget(table, area, &mut app.table_state);
}

fn job_row(job: &Job) -> Row<'static> {
    let (status_str, color) = match job.status {
        JobStatus::Pending => ("PEND", Color::Gray),
        JobStatus::Running => ("RUN", Color::Cyan),
        JobStatus::Completed => ("OK", Color::Green),
        JobStatus::Failed => ("FAIL", Color::Red),
        JobStatus::Cancelled => ("CANC", Color::Yellow),
    };

    let size = |b: Option<u64>| b.map(|b| format_size(b, DECIMAL)).unwrap_or_else(|| "-".to_string());
    let ratio = job
        .compression_ratio
        .map(|r| format!("{:.2}", r))
        .unwrap_or_else(|| "-".to_string());
    let time = job
        .elapsed()
        .map(|d| format!("{}s", d.num_seconds()))
        .unwrap_or_else(|| "-".to_string());

    Row::new(vec![
        status_str.to_string(),
        truncate_string(&job.file_name(), 50),
        progress_bar(job.progress, 10),
        size(job.input_size),
        size(job.output_size),
        ratio,
        time,
        truncate_string(job.error.as_deref().unwrap_or("-"), 60),
    ])
    .style(Style::default().fg(color))
    .height(1)
}

fn render_status_bar(f: &mut Frame, app: &App, area: Rect) {
    let counts = format!(
        "Total: {} | Running: {} | Pending: {} | Done: {} | Failed: {} | Cancelled: {}",
        app.jobs().len(),
        app.count_by_status(JobStatus::Running),
        app.count_by_status(JobStatus::Pending),
        app.count_by_status(JobStatus::Completed),
        app.count_by_status(JobStatus::Failed),
        app.count_by_status(JobStatus::Cancelled),
    );
    let keys = "q=quit ↑/↓=select c=cancel C=cancel all r=retry all +/-=slots";
    let status_text = match &app.message {
        Some(message) => format!("{} | {} | {}", counts, truncate_string(message, 40), keys),
        None => format!("{} | {}", counts, keys),
    };

    let paragraph = Paragraph::new(status_text)
        .block(Block::default().borders(Borders::ALL).title("Status"))
        .wrap(ratatui::widgets::Wrap { trim: true });

    f.render_widget(paragraph, area);
}

fn clamp_percent(value: f64) -> f64 {
    if value.is_finite() {
        value.clamp(0.0, 100.0)
    } else {
        0.0
    }
}

/// Text progress bar, e.g. `█████░░░░░  50%`
fn progress_bar(progress: f64, width: usize) -> String {
    let progress = clamp_percent(progress);
    let filled = ((progress / 100.0) * width as f64).round() as usize;
    format!(
        "{}{} {:>3.0}%",
        "█".repeat(filled),
        "░".repeat(width - filled),
        progress
    )
}

fn truncate_string(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{}...", kept)
    }
}
