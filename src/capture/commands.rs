use std::{
    io::{self, BufRead},
    thread,
};

use crossbeam_channel::{Receiver, unbounded};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum OperatorCommand {
    Select(usize),
    SelectLabel(String),
    Help,
    Quit,
}

/// Interpret one line typed by the operator.
///
/// A number arms that label index, a bare label name arms that label,
/// `q`/`quit`/ESC quits, and a single space, `h` or `?` prints the menu.
pub fn parse_command(line: &str) -> Option<OperatorCommand> {
    let line = line.trim_end_matches(['\r', '\n']);
    if line == " " {
        return Some(OperatorCommand::Help);
    }
    let word = line.trim();
    match word {
        "" => None,
        "q" | "Q" | "quit" | "exit" | "\u{1b}" => Some(OperatorCommand::Quit),
        "h" | "?" | "help" => Some(OperatorCommand::Help),
        _ => match word.parse::<usize>() {
            Ok(index) => Some(OperatorCommand::Select(index)),
            Err(_) => Some(OperatorCommand::SelectLabel(word.to_string())),
        },
    }
}

/// Read operator commands from stdin on a helper thread.
///
/// The channel disconnects when stdin reaches end of file.
pub fn spawn_operator_input() -> io::Result<Receiver<OperatorCommand>> {
    let (tx, rx) = unbounded();
    thread::Builder::new()
        .name("operator-input".into())
        .spawn(move || {
            for line in io::stdin().lock().lines() {
                let line = match line {
                    Ok(line) => line,
                    Err(err) => {
                        log::warn!("stdin read failed: {err:?}");
                        break;
                    }
                };
                if let Some(command) = parse_command(&line) {
                    let quit = command == OperatorCommand::Quit;
                    if tx.send(command).is_err() || quit {
                        break;
                    }
                }
            }
            log::debug!("operator input closed");
        })?;
    Ok(rx)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_operator_lines() {
        assert_eq!(parse_command("3\n"), Some(OperatorCommand::Select(3)));
        assert_eq!(parse_command(" 12 "), Some(OperatorCommand::Select(12)));
        assert_eq!(parse_command("q"), Some(OperatorCommand::Quit));
        assert_eq!(parse_command("\u{1b}"), Some(OperatorCommand::Quit));
        assert_eq!(parse_command(" "), Some(OperatorCommand::Help));
        assert_eq!(parse_command("?"), Some(OperatorCommand::Help));
        assert_eq!(
            parse_command("grab\r\n"),
            Some(OperatorCommand::SelectLabel("grab".to_string()))
        );
        assert_eq!(parse_command(""), None);
        assert_eq!(parse_command("   \t"), None);
    }
}
