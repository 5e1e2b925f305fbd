use std::fmt::Debug;

pub trait Logger: Debug {
    fn log(&mut self, msg: &str);
}

impl<'a, T> Logger for &'a mut T
where
    T: Logger,
{
    fn log(&mut self, msg: &str) {
        T::log(self, msg);
    }
}

macro_rules! log {
    ($logger:expr, $($arg:tt)*) => {
        $crate::util::logging::Logger::log(&mut $logger, &format!($($arg)*))
    };
}

#[derive(Debug, Clone)]
pub struct PrintLogger {
    name: String,
}

impl PrintLogger {
    #[must_use]
    pub const fn new(name: String) -> PrintLogger {
        PrintLogger { name }
    }

    /// A logger for a sub-component, prefixed with both names.
    #[must_use]
    pub fn child(&self, name: &str) -> PrintLogger {
        PrintLogger::new(format!("{}/{}", self.name, name))
    }
}

impl Logger for PrintLogger {
    fn log(&mut self, msg: &str) {
        println!("[{}] {}", self.name, msg);
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NothingLogger;

impl Logger for NothingLogger {
    fn log(&mut self, _msg: &str) {}
}

/// Keeps every line in memory.
#[derive(Debug, Clone, Default)]
pub struct VecLogger {
    pub lines: Vec<String>,
}

impl Logger for VecLogger {
    fn log(&mut self, msg: &str) {
        self.lines.push(msg.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::{Logger, VecLogger};

    #[test]
    fn log_macro_formats() {
        let mut logger = VecLogger::default();
        log!(logger, "loop {} of {}", 1, "router 0");
        let mut by_ref = &mut logger;
        log!(by_ref, "second");
        assert_eq!(logger.lines, vec!["loop 1 of router 0", "second"]);
        logger.log("third");
        assert_eq!(logger.lines.len(), 3);
    }
}
