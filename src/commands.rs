//! This module defines the `Command` enum and its associated methods for parsing
//! user commands of the interactive inspection tool.
//!
//! The `Command` enum represents the commands a user can input, such as opening an
//! image, mounting a volume, listing a directory, or handling invalid or unknown input.

/// Represents a user command of the inspection tool.
#[derive(Debug, PartialEq, Eq)]
pub enum Command {
    /// Command to quit the program.
    Quit,
    /// Command to open a disk image, encapsulating the file path as a `String`.
    Open(String),
    /// Close the current image.
    Close,
    /// Command to print the volume table and the layout of mounted volumes.
    Print,
    /// Mount the given volume and make it current.
    Partition(usize),
    /// List a directory of the current volume, the root if no path is given.
    List(Option<String>),
    /// Recursively list the current volume.
    Tree,
    /// Register a volume starting at the given sector.
    Sector(u64),
    /// Toggle the listing of deleted entries.
    Deleted(bool),
    /// Relax boot sector validation for the next images.
    Skip,
    /// Command for an unknown input, encapsulating the raw input as a `String`.
    Unknown(String),
    /// Command for invalid input, encapsulating an error message as a `String`.
    Invalid(String),
    /// Command for an empty input.
    Empty,
}

impl Command {
    /// Parses a string into a `Command` instance.
    ///
    /// # Returns
    /// - `Command::Unknown` if the input does not match any known command.
    /// - `Command::Invalid` if a known command is missing its argument or has a bad one.
    /// - `Command::Empty` if the input is empty or contains only whitespace.
    pub fn from_string(s: &str) -> Self {
        let mut parts = s.split_whitespace();
        match parts.next() {
            Some("quit") => Command::Quit,
            Some("open") => match parts.next() {
                Some(arg) => Command::Open(arg.to_string()),
                None => Command::Invalid(String::from(
                    "Missing arg: 'open' expects the path to an image file.",
                )),
            },
            Some("close") => Command::Close,
            Some("print") => Command::Print,
            Some("part") => match parts.next() {
                Some(arg) => match arg.parse::<usize>() {
                    Ok(nb) => Command::Partition(nb),
                    Err(_) => Command::Invalid(String::from(
                        "Arg parsing error: 'part' expects an unsigned integer.",
                    )),
                },
                None => Command::Invalid(String::from(
                    "Missing arg: 'part' expects the volume number.",
                )),
            },
            Some("ls") => Command::List(parts.next().map(str::to_string)),
            Some("tree") => Command::Tree,
            Some("sector") => match parts.next().map(str::parse::<u64>) {
                Some(Ok(sector)) => Command::Sector(sector),
                Some(Err(_)) => Command::Invalid(String::from(
                    "Arg parsing error: 'sector' expects an unsigned integer.",
                )),
                None => Command::Invalid(String::from(
                    "Missing arg: 'sector' expects the first sector of the volume.",
                )),
            },
            Some("deleted") => match parts.next() {
                Some("on") => Command::Deleted(true),
                Some("off") => Command::Deleted(false),
                _ => Command::Invalid(String::from("'deleted' expects 'on' or 'off'.")),
            },
            Some("skip") => Command::Skip,
            Some(other) => Command::Unknown(other.to_string()),
            None => Command::Empty,
        }
    }
}
