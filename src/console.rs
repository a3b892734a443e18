//! Console interface
//!
//! Voice-less interaction path: a line-oriented REPL that streams generation
//! output to stdout and shares the same memory store as the voice session.

use anyhow::Result;
use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;
use std::io::Write;
use std::sync::Arc;
use tracing::warn;

use crate::brain::{Brain, StreamEvent};
use crate::memory::MemoryStore;

pub struct ConsoleInterface {
    brain: Arc<Brain>,
    memory: Option<Arc<MemoryStore>>,
}

impl ConsoleInterface {
    pub fn new(brain: Arc<Brain>, memory: Option<Arc<MemoryStore>>) -> Self {
        Self { brain, memory }
    }

    /// Read-eval-print loop; exits on `exit`, `quit`, Ctrl-C or Ctrl-D
    pub async fn run(&self) -> Result<()> {
        let mut editor = DefaultEditor::new()?;
        println!("Aria console. Type 'exit' to quit.");

        loop {
            match editor.readline("you> ") {
                Ok(line) => {
                    let line = line.trim().to_string();
                    if line.is_empty() {
                        continue;
                    }
                    if line == "exit" || line == "quit" {
                        break;
                    }
                    let _ = editor.add_history_entry(&line);
                    self.handle_line(&line).await;
                }
                Err(ReadlineError::Interrupted) | Err(ReadlineError::Eof) => break,
                Err(e) => return Err(e.into()),
            }
        }

        Ok(())
    }

    async fn handle_line(&self, line: &str) {
        if let Some(ref memory) = self.memory {
            if let Err(e) = memory.store_message("user", line).await {
                warn!("Failed to store user message: {e}");
            }
        }

        let mut handle = self.brain.generate_stream(line, &[]);
        let mut response = String::new();

        print!("aria> ");
        let _ = std::io::stdout().flush();

        while let Some(event) = handle.next_event().await {
            match event {
                StreamEvent::Token(token) => {
                    print!("{token}");
                    let _ = std::io::stdout().flush();
                    response.push_str(&token);
                }
                StreamEvent::Done => break,
                StreamEvent::Error(e) => {
                    println!("[error: {e}]");
                    return;
                }
            }
        }
        println!();

        if !response.trim().is_empty() {
            if let Some(ref memory) = self.memory {
                if let Err(e) = memory.store_message("assistant", &response).await {
                    warn!("Failed to store assistant message: {e}");
                }
            }
        }
    }
}
