use ratatui::Frame;
use ratatui::layout::{Constraint, Direction, Layout, Rect};
use ratatui::style::{Color, Modifier, Style};
use ratatui::text::{Line, Span, Text};
use ratatui::widgets::{Block, Borders, Clear, Paragraph, Wrap};
use serde_json::Value;

use crate::app::{App, Focus, LayoutSnapshot};
use crate::block::{Block as ReplBlock, BlockState, Outcome};
use crate::model::Response;
use crate::viewport::Bounds;

const BG: Color = Color::Rgb(9, 15, 25);
const PANEL: Color = Color::Rgb(16, 27, 44);
const SELECTED: Color = Color::Rgb(30, 41, 59);
const ACCENT: Color = Color::Rgb(52, 211, 153);
const MUTED: Color = Color::Rgb(140, 156, 178);
const WARN: Color = Color::Rgb(251, 191, 36);
const ERROR: Color = Color::Rgb(248, 113, 113);
const PL_A: Color = Color::Rgb(17, 94, 89);
const PL_B: Color = Color::Rgb(30, 64, 175);
const PL_C: Color = Color::Rgb(55, 48, 163);

pub fn render(frame: &mut Frame, app: &mut App) {
    let root = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Length(1),
            Constraint::Min(4),
            Constraint::Length(1),
        ])
        .split(frame.area());

    render_header(frame, root[0], app);
    render_body(frame, root[1], app);
    render_footer(frame, root[2], app);

    if app.show_help() {
        render_help_modal(frame);
    }
}

fn render_header(frame: &mut Frame, area: Rect, app: &App) {
    let mut spans = Vec::new();
    push_powerline_segment(&mut spans, " KUI ", Color::Black, ACCENT, PL_A);

    let tabs = app.tab_ids();
    let labels = tabs
        .iter()
        .enumerate()
        .map(|(index, tab)| tab_label(tab.0, index == app.active_tab_index()))
        .collect::<Vec<_>>()
        .join(" ");
    push_powerline_segment(
        &mut spans,
        format!(" 󰓩 {labels} "),
        Color::White,
        PL_A,
        PL_B,
    );

    let blocks = app.blocks();
    let running = blocks.iter().filter(|block| block.is_processing()).count();
    let activity = if running > 0 {
        format!(" 󰔟 {running} running ")
    } else {
        format!(" 󰆍 {} blocks ", blocks.len())
    };
    push_powerline_segment(&mut spans, activity, Color::White, PL_B, BG);

    if app.popup() {
        spans.push(Span::styled(" popup ", Style::default().fg(WARN).bg(BG)));
    }

    frame.render_widget(
        Paragraph::new(Line::from(spans)).style(Style::default().bg(BG).fg(Color::White)),
        area,
    );
}

fn render_body(frame: &mut Frame, area: Rect, app: &mut App) {
    if app.is_sidecar_visible() && area.width >= 60 {
        let chunks = Layout::default()
            .direction(Direction::Horizontal)
            .constraints([Constraint::Percentage(55), Constraint::Percentage(45)])
            .split(area);
        render_blocks(frame, chunks[0], app);
        render_sidecar(frame, chunks[1], app);
    } else {
        render_blocks(frame, area, app);
    }
}

struct BlockRows {
    lines: Vec<Line<'static>>,
    /// First line and line count of each block.
    spans: Vec<(usize, usize)>,
}

fn render_blocks(frame: &mut Frame, area: Rect, app: &mut App) {
    let focus = app.focus();
    let blocks = app.blocks();
    let rows = block_rows(&blocks, app.prompt(), focus);

    let inner_height = area.height.saturating_sub(2) as usize;
    let offset = scroll_offset(&rows, inner_height, app.scroll() as usize, focus);

    let active_block = app.active_block_index().and_then(|index| {
        rows.spans.get(index).map(|(start, len)| {
            Bounds::new(*start as i32 - offset as i32, *len as i32)
        })
    });
    app.set_layout(LayoutSnapshot {
        active_block,
        viewport_height: inner_height as i32,
        raw_input: true,
    });

    let title = format!(" tab {} ", app.active_tab_id());
    let block = Block::default()
        .title(title)
        .borders(Borders::ALL)
        .border_style(if matches!(focus, Focus::Block(_)) {
            Style::default().fg(ACCENT)
        } else {
            Style::default().fg(MUTED)
        })
        .style(Style::default().bg(PANEL));
    let paragraph = Paragraph::new(Text::from(rows.lines))
        .block(block)
        .style(Style::default().fg(Color::White))
        .scroll((offset.min(u16::MAX as usize) as u16, 0));

    frame.render_widget(paragraph, area);
}

fn block_rows(blocks: &[ReplBlock], prompt: &str, focus: Focus) -> BlockRows {
    let mut lines = Vec::new();
    let mut spans = Vec::with_capacity(blocks.len());

    for (index, block) in blocks.iter().enumerate() {
        let start = lines.len();
        let selected = focus == Focus::Block(index);
        let mut block_lines = block_lines(index, block, prompt, focus);
        if selected {
            block_lines = block_lines
                .into_iter()
                .map(|line| line.style(Style::default().bg(SELECTED)))
                .collect();
        }
        lines.extend(block_lines);
        spans.push((start, lines.len() - start));
    }

    BlockRows { lines, spans }
}

fn block_lines(index: usize, block: &ReplBlock, prompt: &str, focus: Focus) -> Vec<Line<'static>> {
    let number = Span::styled(
        format!("[{}] ", index + 1),
        Style::default().fg(marker_color(block)),
    );
    let prompt = Span::styled(
        format!("{prompt} "),
        Style::default().fg(ACCENT).add_modifier(Modifier::BOLD),
    );

    match block.state() {
        BlockState::Active => {
            let mut spans = vec![number, prompt, Span::raw(block.input().to_string())];
            if focus == Focus::ActiveBlock {
                spans.push(Span::styled("█", Style::default().fg(ACCENT)));
            }
            vec![Line::from(spans)]
        }
        BlockState::Processing { command, .. } => vec![
            Line::from(vec![number, prompt, Span::raw(command.clone())]),
            Line::from(Span::styled(
                "  󰔟 running… (Ctrl-C to interrupt)",
                Style::default().fg(WARN),
            )),
        ],
        BlockState::Finished {
            command,
            outcome,
            cancelled,
            ..
        } => {
            let mut lines = vec![Line::from(vec![
                number,
                prompt,
                Span::raw(command.clone()),
                Span::styled(
                    block
                        .duration_ms()
                        .map(|ms| format!("  {}", format_duration(ms)))
                        .unwrap_or_default(),
                    Style::default().fg(MUTED),
                ),
            ])];
            if *cancelled {
                lines.push(Line::from(Span::styled(
                    "  ^C",
                    Style::default().fg(WARN),
                )));
            }
            lines.extend(outcome_lines(outcome));
            lines
        }
        BlockState::Cancelled { command, .. } => {
            let shown = command.clone().unwrap_or_else(|| block.input().to_string());
            vec![
                Line::from(vec![number, prompt, Span::raw(shown)]),
                Line::from(Span::styled("  ✗ cancelled", Style::default().fg(MUTED))),
            ]
        }
    }
}

fn marker_color(block: &ReplBlock) -> Color {
    if block.is_cancelled() {
        WARN
    } else if matches!(block.outcome(), Some(Outcome::Response(Response::Error(_)))) {
        ERROR
    } else if block.is_finished() {
        ACCENT
    } else {
        MUTED
    }
}

fn outcome_lines(outcome: &Outcome) -> Vec<Line<'static>> {
    match outcome {
        Outcome::Ok => vec![Line::from(Span::styled(
            "  ✓ ok",
            Style::default().fg(ACCENT),
        ))],
        Outcome::Response(response) => {
            let color = match response {
                Response::Error(_) => ERROR,
                Response::Bool(false) => WARN,
                _ => Color::White,
            };
            response
                .summary()
                .lines()
                .map(|line| Line::from(Span::styled(format!("  {line}"), Style::default().fg(color))))
                .collect()
        }
    }
}

/// Picks the first visible row. `from_bottom` counts rows scrolled back from
/// the newest output; a selected block is always brought into view.
fn scroll_offset(rows: &BlockRows, height: usize, from_bottom: usize, focus: Focus) -> usize {
    let max_offset = rows.lines.len().saturating_sub(height);
    let mut offset = max_offset.saturating_sub(from_bottom);

    if let Focus::Block(index) = focus
        && let Some((start, len)) = rows.spans.get(index).copied()
    {
        if start < offset {
            offset = start;
        } else if start + len > offset + height {
            offset = (start + len).saturating_sub(height).min(max_offset);
        }
    }
    offset
}

fn render_sidecar(frame: &mut Frame, area: Rect, app: &App) {
    let sidecar = app.sidecar();
    let title = format!(" {} ", compact_text(sidecar.command(), 40));
    let text = if sidecar.is_error() {
        Text::from(Span::styled(sidecar.body().to_string(), Style::default().fg(ERROR)))
    } else {
        highlight_structured_text(sidecar.body())
    };
    let block = Block::default()
        .title(title)
        .title_bottom(Line::from(" Ctrl-R refresh  Ctrl-S hide ").style(Style::default().fg(MUTED)))
        .borders(Borders::ALL)
        .border_style(Style::default().fg(PL_C))
        .style(Style::default().bg(PANEL));
    let paragraph = Paragraph::new(text)
        .block(block)
        .style(Style::default().fg(Color::White))
        .wrap(Wrap { trim: false });

    frame.render_widget(paragraph, area);
}

fn render_footer(frame: &mut Frame, area: Rect, app: &App) {
    let mut spans = Vec::new();
    let (mode_label, mode_bg) = match app.focus() {
        Focus::ActiveBlock => (" 󰘳 input ", PL_A),
        Focus::RawInput => (" 󰌌 raw ", PL_C),
        Focus::Block(_) => (" 󰒅 select ", WARN),
    };
    let mode_fg = if matches!(app.focus(), Focus::Block(_)) {
        Color::Black
    } else {
        Color::White
    };
    push_powerline_segment(&mut spans, mode_label, mode_fg, mode_bg, PL_B);

    if app.focus() == Focus::RawInput {
        let input = app.active_input().unwrap_or_default();
        push_powerline_segment(
            &mut spans,
            format!(" {} {} ", app.prompt(), compact_text(input, 60)),
            Color::White,
            PL_B,
            BG,
        );
    } else {
        let width = area.width.saturating_sub(30).max(8) as usize;
        push_powerline_segment(
            &mut spans,
            format!(" {} ", compact_text(app.status(), width)),
            Color::White,
            PL_B,
            BG,
        );
    }
    spans.push(Span::styled(" F1 help ", Style::default().fg(MUTED).bg(BG)));

    frame.render_widget(
        Paragraph::new(Line::from(spans)).style(Style::default().bg(BG)),
        area,
    );
}

fn render_help_modal(frame: &mut Frame) {
    let area = centered_rect(70, 70, frame.area());
    frame.render_widget(Clear, area);

    let lines = HELP_LINES
        .iter()
        .map(|(keys, action)| {
            Line::from(vec![
                Span::styled(format!("{keys:<14}"), Style::default().fg(ACCENT)),
                Span::raw(*action),
            ])
        })
        .collect::<Vec<_>>();

    let modal = Paragraph::new(lines)
        .wrap(Wrap { trim: false })
        .block(
            Block::default()
                .title("Help")
                .borders(Borders::ALL)
                .border_style(Style::default().fg(ACCENT))
                .style(Style::default().bg(PANEL)),
        )
        .style(Style::default().fg(Color::White));

    frame.render_widget(modal, area);
}

const HELP_LINES: &[(&str, &str)] = &[
    ("Enter", "run the active block"),
    ("Up / Down", "command history"),
    ("Ctrl-C", "interrupt the running command"),
    ("Ctrl-L", "clear the terminal (typed text is kept)"),
    ("Ctrl-U", "clear the input line"),
    ("Alt-Up/Down", "select earlier blocks"),
    ("Del / d", "remove the selected block"),
    ("Esc", "return to the active block"),
    ("PgUp / PgDn", "scroll output"),
    ("Ctrl-S", "show or hide the sidecar"),
    ("Ctrl-R", "re-run the sidecar command"),
    ("Ctrl-T / W", "open or close a tab"),
    ("Alt-1..9", "switch tab"),
    ("Ctrl-Q", "quit"),
];

fn format_duration(ms: i64) -> String {
    if ms < 1000 {
        format!("{ms}ms")
    } else if ms < 60_000 {
        format!("{:.1}s", ms as f64 / 1000.0)
    } else {
        format!("{}m{:02}s", ms / 60_000, (ms % 60_000) / 1000)
    }
}

fn highlight_structured_text(input: &str) -> Text<'static> {
    let trimmed = input.trim_start();
    if (trimmed.starts_with('{') || trimmed.starts_with('['))
        && serde_json::from_str::<Value>(trimmed).is_ok()
    {
        return Text::from(trimmed.lines().map(highlight_json_line).collect::<Vec<_>>());
    }
    Text::from(input.to_string())
}

fn highlight_json_line(line: &str) -> Line<'static> {
    let chars = line.chars().collect::<Vec<_>>();
    let mut index = 0usize;
    let mut spans = Vec::new();

    while index < chars.len() {
        let ch = chars[index];
        if ch == '"' {
            let end = json_string_end(&chars, index);
            let mut look_ahead = end;
            while look_ahead < chars.len() && chars[look_ahead].is_ascii_whitespace() {
                look_ahead += 1;
            }
            let color = if chars.get(look_ahead) == Some(&':') {
                Color::Rgb(103, 232, 249)
            } else {
                Color::Rgb(125, 211, 252)
            };
            spans.push(Span::styled(
                chars[index..end].iter().collect::<String>(),
                Style::default().fg(color),
            ));
            index = end;
            continue;
        }

        let style = match ch {
            '{' | '}' | '[' | ']' | ':' | ',' => Style::default().fg(MUTED),
            '0'..='9' | '-' => Style::default().fg(Color::Rgb(251, 146, 60)),
            't' | 'f' | 'n' => Style::default().fg(WARN),
            _ => Style::default(),
        };
        spans.push(Span::styled(ch.to_string(), style));
        index += 1;
    }

    Line::from(spans)
}

/// Index one past the closing quote of the string starting at `start`.
fn json_string_end(chars: &[char], start: usize) -> usize {
    let mut index = start + 1;
    let mut escaped = false;
    while index < chars.len() {
        match chars[index] {
            '\\' if !escaped => escaped = true,
            '"' if !escaped => return index + 1,
            _ => escaped = false,
        }
        index += 1;
    }
    chars.len()
}

fn push_powerline_segment(
    spans: &mut Vec<Span<'static>>,
    content: impl Into<String>,
    fg: Color,
    bg: Color,
    next_bg: Color,
) {
    spans.push(Span::styled(
        content.into(),
        Style::default().fg(fg).bg(bg).add_modifier(Modifier::BOLD),
    ));
    spans.push(Span::styled("", Style::default().fg(bg).bg(next_bg)));
}

fn tab_label(id: u32, active: bool) -> String {
    if active {
        format!("◉{id}")
    } else {
        id.to_string()
    }
}

fn compact_text(value: &str, max_chars: usize) -> String {
    if value.chars().count() <= max_chars {
        return value.to_string();
    }

    if max_chars <= 1 {
        return "…".to_string();
    }

    let mut out = value
        .chars()
        .take(max_chars.saturating_sub(1))
        .collect::<String>();
    out.push('…');
    out
}

fn centered_rect(percent_x: u16, percent_y: u16, area: Rect) -> Rect {
    let popup_layout = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Percentage((100 - percent_y) / 2),
            Constraint::Percentage(percent_y),
            Constraint::Percentage((100 - percent_y) / 2),
        ])
        .split(area);

    Layout::default()
        .direction(Direction::Horizontal)
        .constraints([
            Constraint::Percentage((100 - percent_x) / 2),
            Constraint::Percentage(percent_x),
            Constraint::Percentage((100 - percent_x) / 2),
        ])
        .split(popup_layout[1])[1]
}
