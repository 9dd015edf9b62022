use std::ops::Range;

/// A pipeline diagnostic (error or warning).
#[derive(Clone, Debug)]
pub struct Diagnostic {
    pub severity: Severity,
    pub message: String,
    pub site: Option<Site>,
    pub notes: Vec<String>,
    pub help: Option<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Severity {
    Error,
    Warning,
}

/// The part of a pipeline a diagnostic is about.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Site {
    pub func: String,
    pub clause: Option<usize>,
    pub directive: Option<usize>,
}

impl Site {
    pub fn func(name: &str) -> Self {
        Site {
            func: name.to_string(),
            clause: None,
            directive: None,
        }
    }

    pub fn clause(name: &str, clause: usize) -> Self {
        Site {
            clause: Some(clause),
            ..Site::func(name)
        }
    }

    pub fn directive(name: &str, directive: usize) -> Self {
        Site {
            directive: Some(directive),
            ..Site::func(name)
        }
    }
}

/// Pretty-printed pipeline text with the byte ranges of every function,
/// update clause and directive in it.
#[derive(Clone, Debug, Default)]
pub struct Listing {
    pub text: String,
    spans: Vec<(Site, Range<usize>)>,
}

impl Listing {
    pub fn push_line(&mut self, site: Option<Site>, line: &str) {
        let start = self.text.len();
        self.text.push_str(line);
        if let Some(site) = site {
            self.spans.push((site, start..self.text.len()));
        }
        self.text.push('\n');
    }

    /// Range of the most specific entry for `site`, falling back to the
    /// function's header line.
    pub fn span_of(&self, site: &Site) -> Option<Range<usize>> {
        self.spans
            .iter()
            .find(|(s, _)| s == site)
            .or_else(|| {
                self.spans
                    .iter()
                    .find(|(s, _)| s.func == site.func && s.clause.is_none() && s.directive.is_none())
            })
            .map(|(_, r)| r.clone())
    }
}

impl Diagnostic {
    pub fn error(message: String) -> Self {
        Self {
            severity: Severity::Error,
            message,
            site: None,
            notes: Vec::new(),
            help: None,
        }
    }

    pub fn warning(message: String) -> Self {
        Self {
            severity: Severity::Warning,
            message,
            site: None,
            notes: Vec::new(),
            help: None,
        }
    }

    pub fn at(mut self, site: Site) -> Self {
        self.site = Some(site);
        self
    }

    pub fn with_note(mut self, note: String) -> Self {
        self.notes.push(note);
        self
    }

    pub fn with_help(mut self, help: String) -> Self {
        self.help = Some(help);
        self
    }

    /// Render the diagnostic to stderr using ariadne.
    pub fn render(&self, listing: &Listing) {
        use ariadne::{Color, Label, Report, ReportKind, Source};

        let filename = "pipeline";
        let kind = match self.severity {
            Severity::Error => ReportKind::Error,
            Severity::Warning => ReportKind::Warning,
        };

        let color = match self.severity {
            Severity::Error => Color::Red,
            Severity::Warning => Color::Yellow,
        };

        let span = self
            .site
            .as_ref()
            .and_then(|site| listing.span_of(site))
            .unwrap_or(0..0);

        let mut report = Report::build(kind, filename, span.start)
            .with_message(&self.message)
            .with_label(
                Label::new((filename, span))
                    .with_message(&self.message)
                    .with_color(color),
            );

        for note in &self.notes {
            report = report.with_note(note);
        }

        if let Some(help) = &self.help {
            report = report.with_help(help);
        }

        if let Err(e) = report
            .finish()
            .eprint((filename, Source::from(listing.text.as_str())))
        {
            tracing::warn!(error = %e, "failed to render diagnostic");
        }
    }
}

/// Render a list of diagnostics.
pub fn render_diagnostics(diagnostics: &[Diagnostic], listing: &Listing) {
    for diag in diagnostics {
        diag.render(listing);
    }
}
