use crate::app::Focus;
use crossterm::event::{KeyCode, KeyEvent, KeyModifiers};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    Quit,
    InputChar(char),
    Backspace,
    ClearLine,
    SubmitInput,
    Interrupt,
    ClearTerminal,
    HistoryPrev,
    HistoryNext,
    SelectPrevBlock,
    SelectNextBlock,
    RemoveSelectedBlock,
    FocusActive,
    PageUp,
    PageDown,
    ToggleSidecar,
    RefreshSidecar,
    NewTab,
    CloseTab,
    NextTab,
    PrevTab,
    SwitchTab(u8),
    ToggleHelp,
}

pub fn map_key(focus: Focus, key: KeyEvent) -> Option<Action> {
    if let Some(action) = map_global_key(key) {
        return Some(action);
    }
    match focus {
        Focus::ActiveBlock | Focus::RawInput => map_input_key(key),
        Focus::Block(_) => map_selection_key(key),
    }
}

fn map_global_key(key: KeyEvent) -> Option<Action> {
    let ctrl = key.modifiers.contains(KeyModifiers::CONTROL);
    let alt = key.modifiers.contains(KeyModifiers::ALT);
    match key.code {
        KeyCode::Char('q') if ctrl => Some(Action::Quit),
        KeyCode::Char('c') if ctrl => Some(Action::Interrupt),
        KeyCode::Char('l') if ctrl => Some(Action::ClearTerminal),
        KeyCode::Char('t') if ctrl => Some(Action::NewTab),
        KeyCode::Char('w') if ctrl => Some(Action::CloseTab),
        KeyCode::Char('s') if ctrl => Some(Action::ToggleSidecar),
        KeyCode::Char('r') if ctrl => Some(Action::RefreshSidecar),
        KeyCode::Char(c) if alt && c.is_ascii_digit() => {
            c.to_digit(10).map(|digit| Action::SwitchTab(digit as u8))
        }
        KeyCode::Right if alt || ctrl => Some(Action::NextTab),
        KeyCode::Left if alt || ctrl => Some(Action::PrevTab),
        KeyCode::Up if alt => Some(Action::SelectPrevBlock),
        KeyCode::Down if alt => Some(Action::SelectNextBlock),
        KeyCode::PageUp => Some(Action::PageUp),
        KeyCode::PageDown => Some(Action::PageDown),
        KeyCode::F(1) => Some(Action::ToggleHelp),
        _ => None,
    }
}

fn map_input_key(key: KeyEvent) -> Option<Action> {
    match key.code {
        KeyCode::Enter => Some(Action::SubmitInput),
        KeyCode::Char('m') | KeyCode::Char('j')
            if key.modifiers.contains(KeyModifiers::CONTROL) =>
        {
            Some(Action::SubmitInput)
        }
        KeyCode::Char('u') if key.modifiers.contains(KeyModifiers::CONTROL) => {
            Some(Action::ClearLine)
        }
        KeyCode::Char('p') if key.modifiers.contains(KeyModifiers::CONTROL) => {
            Some(Action::HistoryPrev)
        }
        KeyCode::Char('n') if key.modifiers.contains(KeyModifiers::CONTROL) => {
            Some(Action::HistoryNext)
        }
        KeyCode::Backspace => Some(Action::Backspace),
        KeyCode::Up => Some(Action::HistoryPrev),
        KeyCode::Down => Some(Action::HistoryNext),
        KeyCode::Esc => Some(Action::FocusActive),
        KeyCode::Tab => Some(Action::InputChar(' ')),
        KeyCode::Char(c) if key.modifiers.is_empty() || key.modifiers == KeyModifiers::SHIFT => {
            Some(Action::InputChar(c))
        }
        _ => None,
    }
}

fn map_selection_key(key: KeyEvent) -> Option<Action> {
    match key.code {
        KeyCode::Up | KeyCode::Char('k') => Some(Action::SelectPrevBlock),
        KeyCode::Down | KeyCode::Char('j') => Some(Action::SelectNextBlock),
        KeyCode::Delete | KeyCode::Char('d') | KeyCode::Char('x') => {
            Some(Action::RemoveSelectedBlock)
        }
        KeyCode::Esc | KeyCode::Enter | KeyCode::Char('i') => Some(Action::FocusActive),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::{Action, map_key};
    use crate::app::Focus;
    use crossterm::event::{KeyCode, KeyEvent, KeyModifiers};

    #[test]
    fn typing_goes_to_the_active_block() {
        let key = KeyEvent::new(KeyCode::Char('k'), KeyModifiers::NONE);
        assert_eq!(map_key(Focus::ActiveBlock, key), Some(Action::InputChar('k')));
        assert_eq!(map_key(Focus::RawInput, key), Some(Action::InputChar('k')));
    }

    #[test]
    fn selection_mode_reuses_letters_for_navigation() {
        let key = KeyEvent::new(KeyCode::Char('k'), KeyModifiers::NONE);
        assert_eq!(map_key(Focus::Block(2), key), Some(Action::SelectPrevBlock));
        let delete = KeyEvent::new(KeyCode::Delete, KeyModifiers::NONE);
        assert_eq!(
            map_key(Focus::Block(2), delete),
            Some(Action::RemoveSelectedBlock)
        );
    }

    #[test]
    fn control_keys_apply_regardless_of_focus() {
        let ctrl_c = KeyEvent::new(KeyCode::Char('c'), KeyModifiers::CONTROL);
        assert_eq!(map_key(Focus::Block(0), ctrl_c), Some(Action::Interrupt));
        let ctrl_l = KeyEvent::new(KeyCode::Char('l'), KeyModifiers::CONTROL);
        assert_eq!(map_key(Focus::ActiveBlock, ctrl_l), Some(Action::ClearTerminal));
        let alt_3 = KeyEvent::new(KeyCode::Char('3'), KeyModifiers::ALT);
        assert_eq!(map_key(Focus::ActiveBlock, alt_3), Some(Action::SwitchTab(3)));
    }
}
