use std::cell::RefCell;
use std::collections::VecDeque;
use std::io::{ self, BufRead, Write };

// Answers the yes/no questions raised while resolving a template
pub trait ConfirmationSource {
  fn confirm(&self, prompt: &str) -> bool;
}

pub struct StdinConfirmation;

impl ConfirmationSource for StdinConfirmation {
  fn confirm(&self, prompt: &str) -> bool {
    eprint!("{} (y/n): ", prompt);
    let _ = io::stderr().flush();

    let mut answer = String::new();
    match io::stdin().lock().read_line(&mut answer) {
      Ok(_) => matches!(answer.trim().to_ascii_lowercase().as_str(), "y" | "yes"),
      Err(e) => {
        tracing::warn!("could not read an answer from stdin: {}", e);
        false
      }
    }
  }
}

pub struct AutoConfirm(pub bool);

impl ConfirmationSource for AutoConfirm {
  fn confirm(&self, prompt: &str) -> bool {
    tracing::debug!("{}: answering {}", prompt, if self.0 { "yes" } else { "no" });
    self.0
  }
}

// Pre-answered prompts, declining once the answers run out
#[derive(Default)]
pub struct ScriptedConfirmation {
  answers: RefCell<VecDeque<bool>>,
  prompts: RefCell<Vec<String>>,
}

impl ScriptedConfirmation {
  pub fn new<I: IntoIterator<Item = bool>>(answers: I) -> Self {
    Self {
      answers: RefCell::new(answers.into_iter().collect()),
      prompts: RefCell::new(vec![]),
    }
  }

  pub fn prompts(&self) -> Vec<String> {
    self.prompts.borrow().clone()
  }
}

impl ConfirmationSource for ScriptedConfirmation {
  fn confirm(&self, prompt: &str) -> bool {
    self.prompts.borrow_mut().push(prompt.to_owned());
    self.answers.borrow_mut().pop_front().unwrap_or(false)
  }
}
