use std::fmt::{self, Display, Write};

use crate::failure::{FunctionApplicationFailure, ResolutionFailure, ResolutionFailureVisitor};
use crate::value::ValueRequirement;

/// Renders a failure tree as indented text, one line per event.
#[derive(Debug, Default)]
pub struct FailurePrinter {
    depth: usize,
    out: String,
}

impl FailurePrinter {
    pub fn print(failure: &ResolutionFailure) -> String {
        let mut printer = FailurePrinter::default();
        printer.header(failure.requirement());
        printer.depth += 1;
        failure.accept(&mut printer);
        printer.out
    }

    fn header(&mut self, requirement: &ValueRequirement) {
        let _ = writeln!(self.out, "{:indent$}{requirement}", "", indent = self.depth * 2);
    }

    fn line(&mut self, text: impl Display) {
        let _ = writeln!(self.out, "{:indent$}{text}", "", indent = self.depth * 2);
    }

    fn nested(&mut self, label: &str, failures: &[ResolutionFailure]) {
        if failures.is_empty() {
            return;
        }
        self.line(label);
        self.depth += 1;
        for failure in failures {
            self.header(failure.requirement());
            self.depth += 1;
            failure.accept(self);
            self.depth -= 1;
        }
        self.depth -= 1;
    }
}

impl ResolutionFailureVisitor for FailurePrinter {
    type Output = ();

    fn visit_recursive_requirement(&mut self, _: &ValueRequirement) {
        self.line("recursive requirement");
    }

    fn visit_could_not_resolve(&mut self, _: &ValueRequirement) {
        self.line("could not resolve target");
    }

    fn visit_no_functions(&mut self, _: &ValueRequirement) {
        self.line("no functions");
    }

    fn visit_market_data_missing(&mut self, _: &ValueRequirement) {
        self.line("market data missing");
    }

    fn visit_function_application(&mut self, _: &ValueRequirement, application: &FunctionApplicationFailure) {
        self.line(format_args!(
            "{} producing {}: {:?}",
            application.function, application.output, application.outcome
        ));
        self.depth += 1;
        for input in &application.satisfied {
            self.line(format_args!("satisfied {} by {}", input.requirement, input.specification));
        }
        self.nested("unsatisfied", &application.unsatisfied);
        self.nested("additional unsatisfied", &application.additional_unsatisfied);
        self.depth -= 1;
    }
}

impl Display for ResolutionFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&FailurePrinter::print(self))
    }
}
