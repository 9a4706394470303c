//! Workers (health, load and counters per worker)
//! Queue (queued and retrying tasks, broker depths)
//! Failed (latest permanently failed tasks with their errors)

use std::{
  error::Error,
  io,
  sync::Arc,
  thread,
  time::{Duration, Instant},
};

use crossterm::{
  event::{self, DisableMouseCapture, EnableMouseCapture, Event as CEvent, KeyCode},
  execute,
  terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen},
};
use lapin::options::QueueDeclareOptions;
use lapin::types::FieldTable;
use lapin::Channel;
use tokio::runtime::Runtime;
use tui::{
  backend::{Backend, CrosstermBackend},
  layout::{Constraint, Direction, Layout, Rect},
  style::{Color, Modifier, Style},
  text::{Span, Spans},
  widgets::{Block, Borders, List, ListItem, Paragraph, Tabs},
  Terminal,
};
use dispatchq::{
  clock::SystemClock,
  config::DashboardConfig,
  database::setup_database,
  messaging::{create_rabbit_channel, DEAD_LETTER_QUEUE, TASK_QUEUE},
  models::{Task, TaskStatistics, TaskStatus, WorkerHealth, WorkerStatus},
  store::{PgTaskRepository, PgWorkerRepository, TaskRepository},
  worker_registry::{WorkerRegistry, HEARTBEAT_TIMEOUT},
};

const REFRESH: Duration = Duration::from_secs(2);
const LIST_LIMIT: u32 = 10;

#[derive(Clone, Copy)]
enum DashboardTab {
  Workers,
  Queue,
  Failed,
}

#[derive(Default)]
struct Snapshot {
  workers: Vec<WorkerHealth>,
  queued: Vec<Task>,
  retrying: Vec<Task>,
  failed: Vec<Task>,
  statistics: TaskStatistics,
  queue_depth: u32,
  dead_letter_depth: u32,
  error: Option<String>,
}

impl Snapshot {
  fn failed(error: &dispatchq::error::CoreError) -> Self {
    Snapshot { error: Some(error.to_string()), ..Snapshot::default() }
  }

  fn footer(&self) -> String {
    match &self.error {
      Some(e) => format!("Refresh error: {}", e),
      None => "←/→: Switch Tabs | q: Quit".to_string(),
    }
  }
}

struct App {
  current_tab: DashboardTab,
  snapshot: Snapshot,
}

impl App {
  fn new() -> Self {
    Self {
      current_tab: DashboardTab::Workers,
      snapshot: Snapshot::default(),
    }
  }

  fn next_tab(&mut self) {
    self.current_tab = match self.current_tab {
      DashboardTab::Workers => DashboardTab::Queue,
      DashboardTab::Queue => DashboardTab::Failed,
      DashboardTab::Failed => DashboardTab::Workers,
    }
  }

  fn previous_tab(&mut self) {
    self.current_tab = match self.current_tab {
      DashboardTab::Workers => DashboardTab::Failed,
      DashboardTab::Queue => DashboardTab::Workers,
      DashboardTab::Failed => DashboardTab::Queue,
    }
  }
}

struct Sources {
  tasks: PgTaskRepository,
  workers: WorkerRegistry,
  channel: Channel,
}

async fn queue_depth(channel: &Channel, queue: &str) -> Result<u32, lapin::Error> {
  let queue = channel
    .queue_declare(queue, QueueDeclareOptions { passive: true, ..Default::default() }, FieldTable::default())
    .await?;
  Ok(queue.message_count())
}

async fn fetch_snapshot(sources: &Sources) -> dispatchq::error::Result<Snapshot> {
  let workers = sources.workers.list().await?;
  let active_workers = workers.iter().filter(|w| w.status != WorkerStatus::Offline).count() as u64;
  let counts = sources.tasks.count_by_status().await?;
  let mut snapshot = Snapshot {
    workers,
    queued: sources.tasks.list(Some(TaskStatus::Queued), 0, LIST_LIMIT).await?.content,
    retrying: sources.tasks.list(Some(TaskStatus::Retrying), 0, LIST_LIMIT).await?.content,
    failed: sources.tasks.list(Some(TaskStatus::Failed), 0, LIST_LIMIT).await?.content,
    statistics: TaskStatistics::from_counts(counts, active_workers),
    ..Snapshot::default()
  };
  match queue_depth(&sources.channel, TASK_QUEUE).await {
    Ok(depth) => snapshot.queue_depth = depth,
    Err(e) => snapshot.error = Some(format!("{}: {}", TASK_QUEUE, e)),
  }
  match queue_depth(&sources.channel, DEAD_LETTER_QUEUE).await {
    Ok(depth) => snapshot.dead_letter_depth = depth,
    Err(e) => snapshot.error = Some(format!("{}: {}", DEAD_LETTER_QUEUE, e)),
  }
  Ok(snapshot)
}

fn main() -> Result<(), Box<dyn Error>> {
  let config = DashboardConfig::from_env()?;
  let rt = Runtime::new()?;
  let db_pool = rt.block_on(setup_database(&config.database_url))?;
  let channel = rt.block_on(create_rabbit_channel(&config.rabbitmq_url))?;

  let sources = Arc::new(Sources {
    tasks: PgTaskRepository::new(db_pool.clone()),
    workers: WorkerRegistry::new(Arc::new(PgWorkerRepository::new(db_pool)), Arc::new(SystemClock), HEARTBEAT_TIMEOUT),
    channel,
  });

  let (tx, rx) = std::sync::mpsc::channel::<Snapshot>();
  thread::spawn(move || {
    loop {
      // No subscriber while the terminal is raw; the footer carries the error.
      let snapshot = rt
        .block_on(fetch_snapshot(&sources))
        .unwrap_or_else(|e| Snapshot::failed(&e));
      if tx.send(snapshot).is_err() {
        break;
      }
      thread::sleep(REFRESH);
    }
  });

  enable_raw_mode()?;
  let mut stdout = io::stdout();
  execute!(stdout, EnterAlternateScreen, EnableMouseCapture)?;
  let backend = CrosstermBackend::new(stdout);
  let mut terminal = Terminal::new(backend)?;

  let mut app = App::new();
  let tick_rate = Duration::from_millis(500);
  let mut last_tick = Instant::now();

  loop {
    if let Ok(snapshot) = rx.try_recv() {
      app.snapshot = snapshot;
    }
    terminal.draw(|f| ui(f, &app))?;

    let timeout = tick_rate
      .checked_sub(last_tick.elapsed())
      .unwrap_or_else(|| Duration::from_secs(0));
    if event::poll(timeout)? {
      if let CEvent::Key(key) = event::read()? {
        match key.code {
          KeyCode::Char('q') => break,
          KeyCode::Right | KeyCode::Tab => app.next_tab(),
          KeyCode::Left => app.previous_tab(),
          _ => {}
        }
      }
    }
    if last_tick.elapsed() >= tick_rate {
      last_tick = Instant::now();
    }
  }

  disable_raw_mode()?;
  execute!(terminal.backend_mut(), LeaveAlternateScreen, DisableMouseCapture)?;
  terminal.show_cursor()?;
  Ok(())
}

fn status_color(status: WorkerStatus) -> Color {
  match status {
    WorkerStatus::Online | WorkerStatus::Idle => Color::Green,
    WorkerStatus::Busy => Color::Yellow,
    WorkerStatus::Offline => Color::Red,
  }
}

fn ui<B: Backend>(f: &mut tui::Frame<B>, app: &App) {
  let chunks = Layout::default()
    .direction(Direction::Vertical)
    .margin(1)
    .constraints([
      Constraint::Length(3),
      Constraint::Length(3),
      Constraint::Min(0),
      Constraint::Length(3),
    ].as_ref())
    .split(f.size());

  let tab_titles = vec!["Workers", "Queue", "Failed"];
  let tabs = Tabs::new(
    tab_titles
      .iter()
      .map(|t| Spans::from(Span::styled(*t, Style::default().fg(Color::Yellow))))
      .collect(),
  )
    .block(Block::default().borders(Borders::ALL).title("dispatchq"))
    .highlight_style(Style::default().fg(Color::Cyan).add_modifier(Modifier::BOLD))
    .select(match app.current_tab {
      DashboardTab::Workers => 0,
      DashboardTab::Queue => 1,
      DashboardTab::Failed => 2,
    });
  f.render_widget(tabs, chunks[0]);

  let stats = &app.snapshot.statistics;
  let summary = Paragraph::new(format!(
    "Total {} | Pending {} | Processing {} | Retrying {} | Completed {} | Failed {} | Success {:.1}% | Workers {}",
    stats.total_tasks,
    stats.pending_tasks,
    stats.processing_tasks,
    stats.retrying_tasks,
    stats.completed_tasks,
    stats.failed_tasks,
    stats.success_rate,
    stats.active_workers,
  ))
    .block(Block::default().borders(Borders::ALL).title("Totals"));
  f.render_widget(summary, chunks[1]);

  match app.current_tab {
    DashboardTab::Workers => render_workers(f, app, chunks[2]),
    DashboardTab::Queue => render_queue(f, app, chunks[2]),
    DashboardTab::Failed => render_failed(f, app, chunks[2]),
  }

  let footer = Paragraph::new(app.snapshot.footer())
    .style(Style::default().fg(Color::White))
    .block(Block::default().borders(Borders::ALL));
  f.render_widget(footer, chunks[3]);
}

fn render_workers<B: Backend>(f: &mut tui::Frame<B>, app: &App, area: Rect) {
  let items: Vec<ListItem> = app.snapshot.workers.iter().map(|w| {
    let usage = match (w.cpu_usage, w.memory_usage) {
      (Some(cpu), Some(mem)) => format!("CPU {:.0}% | Mem {:.0}%", cpu, mem),
      _ => "No load data".to_string(),
    };
    ListItem::new(vec![
      Spans::from(vec![
        Span::styled(format!("{} ", w.worker_id), Style::default().add_modifier(Modifier::BOLD)),
        Span::styled(w.status.as_str(), Style::default().fg(status_color(w.status))),
      ]),
      Spans::from(Span::raw(format!(
        "Active {} | Processed {} | Failed {} | {}",
        w.active_tasks, w.total_processed, w.total_failed, usage
      ))),
      Spans::from(Span::raw(format!("Last heartbeat: {}", w.last_heartbeat.format("%Y-%m-%d %H:%M:%S")))),
    ])
  }).collect();
  let list = List::new(items)
    .block(Block::default().borders(Borders::ALL).title("Workers"));
  f.render_widget(list, area);
}

fn task_line(task: &Task) -> ListItem<'_> {
  ListItem::new(Spans::from(vec![
    Span::styled(format!("{} ", task.id), Style::default().fg(Color::Yellow).add_modifier(Modifier::BOLD)),
    Span::raw(format!(
      "{} | priority {} | retries {}/{}",
      task.task_type, task.priority, task.retry_count, task.max_retries
    )),
  ]))
}

fn render_queue<B: Backend>(f: &mut tui::Frame<B>, app: &App, area: Rect) {
  let chunks = Layout::default()
    .direction(Direction::Horizontal)
    .constraints([Constraint::Percentage(50), Constraint::Percentage(50)].as_ref())
    .split(area);

  let queued: Vec<ListItem> = app.snapshot.queued.iter().map(task_line).collect();
  let header = format!("Queued (broker depth {}, dead letters {})", app.snapshot.queue_depth, app.snapshot.dead_letter_depth);
  f.render_widget(List::new(queued).block(Block::default().borders(Borders::ALL).title(header)), chunks[0]);

  let retrying: Vec<ListItem> = app.snapshot.retrying.iter().map(task_line).collect();
  f.render_widget(
    List::new(retrying).block(Block::default().borders(Borders::ALL).title("Awaiting retry")),
    chunks[1],
  );
}

fn render_failed<B: Backend>(f: &mut tui::Frame<B>, app: &App, area: Rect) {
  let items: Vec<ListItem> = app.snapshot.failed.iter().map(|t| {
    ListItem::new(vec![
      Spans::from(vec![
        Span::styled(format!("{} ", t.id), Style::default().fg(Color::Red).add_modifier(Modifier::BOLD)),
        Span::raw(format!("{} after {} retries", t.task_type, t.retry_count)),
      ]),
      Spans::from(Span::raw(t.error_message.clone().unwrap_or_default())),
    ])
  }).collect();
  f.render_widget(
    List::new(items).block(Block::default().borders(Borders::ALL).title("Failed")),
    area,
  );
}
