//! Line-oriented operator console.
//!
//! Commands are read from stdin and forwarded to the controller as events;
//! updates coming back from the controller are printed by a separate thread
//! so a slow backend never blocks the prompt.

use std::{
    io::{BufRead, Write},
    thread::{self, JoinHandle},
};

use crossbeam_channel::{Receiver, Sender};

use crate::{
    backend::BackendRequest,
    controller::{Command, Event, StatusLevel, Update, collector::RecordRequest},
    error::ConsoleError,
};

pub const HELP: &str = "\
commands:
  start                     start live monitoring
  pause                     stop monitoring, keep the camera open
  stop                      stop monitoring and release the camera
  record <label> [count]    record samples for a gesture, label may have spaces
  cancel                    stop the current recording, discard samples
  resubmit                  retry recordings that failed to save
  status                    show mode, camera and current gesture
  gestures                  list recorded gestures
  mappings                  list gesture to action mappings
  map <gesture> <action>    map a gesture to an action
  unmap <gesture>           remove a mapping
  delete <gesture>          delete a gesture and its samples
  retrain                   retrain the backend model
  threshold <value>         set the backend confidence threshold
  system start|stop         run or pause backend recognition
  backend-gesture           show the backend's last recognised gesture
  help                      show this list
  quit                      exit";

#[derive(Debug, PartialEq)]
pub enum Input {
    Command(Command),
    Help,
    Quit,
    Empty,
}

/// Parses one console line. `default_target` is the sample count used when
/// `record` is given without one.
pub fn parse_line(line: &str, default_target: u32) -> Result<Input, ConsoleError> {
    let mut words = line.split_whitespace();
    let Some(verb) = words.next() else {
        return Ok(Input::Empty);
    };
    let args: Vec<&str> = words.collect();

    let command = match (verb.to_ascii_lowercase().as_str(), args.as_slice()) {
        ("help" | "?", _) => return Ok(Input::Help),
        ("quit" | "exit", _) => return Ok(Input::Quit),
        ("start", []) => Command::Start,
        ("pause", []) => Command::Pause,
        ("stop", []) => Command::Stop,
        ("record", _) => {
            let rest = line.trim_start()[verb.len()..].trim();
            let (label, target) = parse_record(rest, default_target)?;
            Command::Record { label, target }
        }
        ("cancel", []) => Command::CancelRecord,
        ("resubmit", []) => Command::Resubmit,
        ("status", []) => Command::Status,
        ("gestures", []) => Command::Backend(BackendRequest::ListGestures),
        ("mappings", []) => Command::Backend(BackendRequest::ListMappings),
        ("map", [gesture, action @ ..]) if !action.is_empty() => {
            Command::Backend(BackendRequest::MapAction {
                gesture: gesture.to_string(),
                action: action.join(" "),
            })
        }
        ("map", _) => return Err(ConsoleError::Usage("map <gesture> <action>")),
        ("unmap", [gesture]) => Command::Backend(BackendRequest::RemoveMapping {
            gesture: gesture.to_string(),
        }),
        ("unmap", _) => return Err(ConsoleError::Usage("unmap <gesture>")),
        ("delete", [gesture]) => Command::Backend(BackendRequest::DeleteGesture {
            gesture: gesture.to_string(),
        }),
        ("delete", _) => return Err(ConsoleError::Usage("delete <gesture>")),
        ("retrain", []) => Command::Backend(BackendRequest::Retrain),
        ("threshold", [value]) => match value.parse::<f32>() {
            Ok(threshold) if threshold.is_finite() => {
                Command::Backend(BackendRequest::SetConfidence(threshold))
            }
            _ => return Err(ConsoleError::Usage("threshold <value>")),
        },
        ("threshold", _) => return Err(ConsoleError::Usage("threshold <value>")),
        ("system", ["start"]) => Command::Backend(BackendRequest::SystemStart),
        ("system", ["stop"]) => Command::Backend(BackendRequest::SystemStop),
        ("system", _) => return Err(ConsoleError::Usage("system start|stop")),
        ("backend-gesture", []) => Command::Backend(BackendRequest::CurrentGesture),
        _ => return Err(ConsoleError::UnknownCommand(line.trim().to_string())),
    };
    Ok(Input::Command(command))
}

/// Splits `record` arguments into label and count. Labels may contain spaces;
/// a trailing number is the count. Quote the label to keep a trailing number
/// in it: `record "take 2" 30`.
fn parse_record(rest: &str, default_target: u32) -> Result<(String, i64), ConsoleError> {
    const USAGE: ConsoleError = ConsoleError::Usage("record <label> [count]");

    if let Some(quoted) = rest.strip_prefix('"') {
        let (label, count) = quoted.split_once('"').ok_or(USAGE)?;
        let label = label.trim();
        if label.is_empty() {
            return Err(USAGE);
        }
        let target = match count.trim() {
            "" => i64::from(default_target),
            count => RecordRequest::parse_target(count)?,
        };
        return Ok((label.to_string(), target));
    }

    match rest.rsplit_once(char::is_whitespace) {
        None if rest.is_empty() => Err(USAGE),
        None => Ok((rest.to_string(), i64::from(default_target))),
        Some((label, count)) => match count.parse::<i64>() {
            Ok(target) => Ok((label.trim_end().to_string(), target)),
            Err(_) => Ok((rest.to_string(), i64::from(default_target))),
        },
    }
}

pub fn render(update: &Update) -> String {
    match update {
        Update::Status(line) => match line.level {
            StatusLevel::Info => line.text.clone(),
            StatusLevel::Error => format!("error: {}", line.text),
        },
        Update::Mode(mode) => format!("mode: {mode}"),
        Update::Gesture(display) => format!("Current Gesture: {}", display.display_text()),
        Update::Progress {
            label,
            collected,
            target,
        } => {
            let percent = if *target == 0 {
                0
            } else {
                collected * 100 / target
            };
            format!("recording '{label}': {collected}/{target} ({percent}%)")
        }
    }
}

/// Prints controller updates until the controller drops its sender.
pub fn spawn_printer<W>(updates: Receiver<Update>, mut out: W) -> std::io::Result<JoinHandle<()>>
where
    W: Write + Send + 'static,
{
    thread::Builder::new()
        .name("console-printer".into())
        .spawn(move || {
            for update in updates {
                if let Err(err) = writeln!(out, "{}", render(&update)).and_then(|_| out.flush()) {
                    log::warn!("console output failed: {err}");
                    break;
                }
            }
        })
}

/// Reads commands until `quit` or end of input. Parse errors are written to
/// `err_out` and never reach the controller.
pub fn run<R, W>(
    input: R,
    mut err_out: W,
    events: &Sender<Event>,
    default_target: u32,
) -> anyhow::Result<()>
where
    R: BufRead,
    W: Write,
{
    for line in input.lines() {
        let line = line?;
        match parse_line(&line, default_target) {
            Ok(Input::Command(command)) => {
                log::debug!("command: {}", command.name());
                if events.send(Event::Command(command)).is_err() {
                    anyhow::bail!("controller stopped");
                }
            }
            Ok(Input::Help) => writeln!(err_out, "{HELP}")?,
            Ok(Input::Quit) => break,
            Ok(Input::Empty) => {}
            Err(err) => writeln!(err_out, "{err}")?,
        }
    }
    Ok(())
}
