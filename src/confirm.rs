use std::io::{self, BufRead, Write};
use std::sync::{Arc, Condvar, Mutex};

/// One-shot yes/no answer shared between the thread waiting for it and the
/// thread giving it.
#[derive(Clone, Default)]
pub struct ConfirmGate {
    inner: Arc<(Mutex<Option<bool>>, Condvar)>,
}

impl ConfirmGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn confirm(&self) {
        self.answer(true);
    }

    pub fn decline(&self) {
        self.answer(false);
    }

    /// The first answer wins; later ones are ignored.
    fn answer(&self, proceed: bool) {
        let (answer, ready) = &*self.inner;
        let mut answer = answer.lock().unwrap_or_else(|p| p.into_inner());
        if answer.is_none() {
            *answer = Some(proceed);
            ready.notify_all();
        }
    }

    /// Blocks until an answer is given and returns it.
    pub fn wait(&self) -> bool {
        let (answer, ready) = &*self.inner;
        let mut answer = answer.lock().unwrap_or_else(|p| p.into_inner());
        loop {
            if let Some(proceed) = *answer {
                return proceed;
            }
            answer = ready.wait(answer).unwrap_or_else(|p| p.into_inner());
        }
    }

    pub fn is_answered(&self) -> bool {
        let (answer, _) = &*self.inner;
        answer.lock().unwrap_or_else(|p| p.into_inner()).is_some()
    }

    /// Whether another handle to this gate exists, i.e. someone else can
    /// answer it.
    pub fn is_shared(&self) -> bool {
        Arc::strong_count(&self.inner) > 1
    }

    /// Asks `Continue training (y/n)?` on `output` until `input` yields `y` or
    /// `n`. End of input declines.
    pub fn prompt<R: BufRead, W: Write>(&self, mut input: R, mut output: W) -> io::Result<bool> {
        writeln!(output, "CarbonTracker: Continue training (y/n)?")?;
        let mut line = String::new();
        loop {
            line.clear();
            if input.read_line(&mut line)? == 0 {
                self.decline();
                return Ok(false);
            }
            match line.trim().to_ascii_lowercase().as_str() {
                "y" => {
                    writeln!(output, "CarbonTracker: Continuing...")?;
                    self.confirm();
                    return Ok(true);
                }
                "n" => {
                    writeln!(output, "CarbonTracker: Quitting...")?;
                    self.decline();
                    return Ok(false);
                }
                _ => writeln!(output, "CarbonTracker: Input not recognized. Try again (y/n):")?,
            }
        }
    }

    pub fn prompt_stdin(&self) -> io::Result<bool> {
        self.prompt(io::stdin().lock(), io::stdout())
    }
}
