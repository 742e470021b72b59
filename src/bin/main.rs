//! This is the main entry point for the volume inspection tool.
//!
//! The program provides an interactive command-line interface for inspecting disk images.
//! Users can open an image, print its layout, mount volumes, and list their directories.
//!
//! Usage: `main [-v...] [IMAGE]`. Each `-v` raises the log verbosity by one level.

use log::{error, info, warn};
use std::io::{self, BufRead, Write};
use vol_forensics::commands::Command;
use vol_forensics::{DirRef, DirectoryEntry, InspectError, InspectOptions, Session};

/// Represents the runtime state of the program.
struct RunState {
    /// The currently opened disk image.
    session: Option<Session>,
    /// Volume in inspection mode.
    vol_nb: Option<usize>,
    /// Enable the strict validation of boot sectors.
    strict: bool,
    /// Show deleted entries in listings.
    show_deleted: bool,
}

impl RunState {
    fn options(&self) -> InspectOptions {
        InspectOptions::default()
            .strict_bpb(self.strict)
            .include_deleted(true)
    }

    fn open(&mut self, path: &str) {
        self.close();
        match Session::open(path, self.options()) {
            Ok(session) => {
                println!("Opened {path}: {} volume(s)", session.volumes().map_or(0, |v| v.len()));
                self.session = Some(session);
            }
            Err(err) => error!("{err}"),
        }
    }

    fn close(&mut self) {
        if let Some(mut session) = self.session.take() {
            session.close();
        }
        self.vol_nb = None;
    }
}

fn main() {
    let mut verbosity = 1;
    let mut path = None;
    for arg in std::env::args().skip(1) {
        match arg.as_str() {
            "-v" | "-vv" | "-vvv" => verbosity += arg.len() - 1,
            _ => path = Some(arg),
        }
    }

    if let Err(err) = stderrlog::new()
        .module("vol_forensics")
        .module(module_path!())
        .verbosity(verbosity)
        .init()
    {
        eprintln!("Logger initialization failed: {err}");
    }

    let mut run_state = RunState {
        session: None,
        vol_nb: None,
        strict: true,
        show_deleted: true,
    };
    if let Some(path) = path {
        run_state.open(&path);
    }

    let stdin = io::stdin();
    let mut lines = stdin.lock().lines();
    loop {
        print!("> ");
        if io::stdout().flush().is_err() {
            break;
        }

        let line = match lines.next() {
            Some(Ok(line)) => line,
            Some(Err(err)) => {
                error!("Failed to read command: {err}");
                break;
            }
            None => break,
        };

        match Command::from_string(&line) {
            Command::Quit => break,
            Command::Open(path) => run_state.open(&path),
            Command::Close => run_state.close(),
            Command::Print => match &run_state.session {
                Some(session) => match session.layout(3) {
                    Ok(layout) => print!("{layout}"),
                    Err(err) => error!("Print layout error: {err}"),
                },
                None => warn!("Open disk image first"),
            },
            Command::Partition(vol_nb) => {
                let Some(session) = run_state.session.as_mut() else {
                    warn!("Open disk image first");
                    continue;
                };
                match session.mount(vol_nb) {
                    Ok(mounted) => {
                        println!("Volume #{vol_nb}: {}", mounted.kind());
                        run_state.vol_nb = Some(vol_nb);
                    }
                    Err(err) => error!("{err}"),
                }
            }
            Command::List(path) => {
                let show_deleted = run_state.show_deleted;
                match current(&mut run_state) {
                    Some((session, vol_nb)) => {
                        let listed = session
                            .resolve_dir(vol_nb, path.as_deref().unwrap_or("/"))
                            .and_then(|dir| print_dir(session, &dir, show_deleted));
                        if let Err(err) = listed {
                            error!("{err}");
                        }
                    }
                    None => warn!("Select a volume first"),
                }
            }
            Command::Tree => {
                let show_deleted = run_state.show_deleted;
                match current(&mut run_state) {
                    Some((session, vol_nb)) => {
                        let listed = session.root(vol_nb).and_then(|dir| {
                            session.walk_tree(&dir, |depth, entry| {
                                if show_deleted || !entry.is_deleted() {
                                    print_entry(entry, depth);
                                }
                            })
                        });
                        if let Err(err) = listed {
                            error!("Tree printing failed: {err}");
                        }
                    }
                    None => warn!("Select a volume first"),
                }
            }
            Command::Sector(sector) => match run_state.session.as_mut() {
                Some(session) => match session.add_volume_at(sector) {
                    Ok(index) => println!("Registered volume #{index}"),
                    Err(err) => error!("{err}"),
                },
                None => warn!("Open disk image first"),
            },
            Command::Deleted(show) => run_state.show_deleted = show,
            Command::Skip => {
                run_state.strict = false;
                info!("Boot sector validation relaxed for the next opened image");
            }
            Command::Unknown(s) => error!("Unknown command: {s:?}"),
            Command::Invalid(s) => error!("{s}"),
            Command::Empty => {}
        }
    }
}

fn current(run_state: &mut RunState) -> Option<(&mut Session, usize)> {
    let vol_nb = run_state.vol_nb?;
    run_state.session.as_mut().map(|session| (session, vol_nb))
}

/// Prints the entries of one directory.
fn print_dir(session: &Session, dir: &DirRef, show_deleted: bool) -> Result<(), InspectError> {
    for entry in session.list_directory(dir)? {
        match entry {
            Ok(entry) if entry.is_deleted() && !show_deleted => {}
            Ok(entry) => print_entry(&entry, 0),
            Err(err) => {
                error!("Listing interrupted: {err}");
                break;
            }
        }
    }
    Ok(())
}

fn print_entry(entry: &DirectoryEntry, depth: usize) {
    let modified = entry
        .modified()
        .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_default();
    println!(
        "{}{:<7} {entry} {modified}",
        "  ".repeat(depth + 1),
        entry.kind().to_string()
    );
}
