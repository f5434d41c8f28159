use std::{
    fmt::{Debug, Display, Write},
    str::FromStr,
};

use {
    anyhow::Context,
    lexopt::{Arg, Parser, ValueExt},
    regex_lite::Regex,
};

/// Parses the argument from the given parser as a command name, and returns
/// it. If the next arg isn't a simple value then this returns an error.
///
/// This also handles the case where -h/--help is given, in which case, the
/// given usage information is converted into an error and printed.
pub fn next_as_command(usage: &str, p: &mut Parser) -> anyhow::Result<String> {
    let usage = usage.trim();
    let arg = match p.next()? {
        Some(arg) => arg,
        None => anyhow::bail!("{}", usage),
    };
    let cmd = match arg {
        Arg::Value(cmd) => cmd.string()?,
        Arg::Short('h') | Arg::Long("help") => anyhow::bail!("{}", usage),
        arg => return Err(arg.unexpected().into()),
    };
    Ok(cmd)
}

/// Parses the next 'p.value()' into 'T'. Any error messages will include the
/// given flag name in them.
pub fn parse<T>(p: &mut Parser, flag_name: &'static str) -> anyhow::Result<T>
where
    T: FromStr,
    <T as FromStr>::Err: Display + Debug + Send + Sync + 'static,
{
    // This is written somewhat awkwardly and the type signature is also
    // pretty funky primarily because of the following two things: 1) the
    // 'FromStr' impls in this crate just use 'anyhow::Error' for their error
    // type and 2) 'anyhow::Error' does not impl 'std::error::Error'.
    let osv = p.value().context(flag_name)?;
    let strv = match osv.to_str() {
        Some(strv) => strv,
        None => {
            let err = lexopt::Error::NonUnicodeValue(osv.into());
            return Err(anyhow::Error::from(err).context(flag_name));
        }
    };
    let parsed = match strv.parse() {
        Err(err) => return Err(anyhow::Error::msg(err)),
        Ok(parsed) => parsed,
    };
    Ok(parsed)
}

/// This defines a flag for controlling the use of color in the output.
#[derive(Clone, Copy, Debug)]
pub enum Color {
    /// Color is only enabled when the output is a tty.
    Auto,
    /// Color is always enabled.
    Always,
    /// Color is disabled.
    Never,
}

impl Color {
    pub const USAGE: Usage = Usage::new(
        "--color <mode>",
        "One of: auto, always, never.",
        r#"
Whether to use color (default: auto).

When enabled, a modest amount of color is used to help make the output more
digestible, typically be enabling quick eye scanning. For example, the winning
code generator in a comparison table is colorized. The choices are: auto,
always, never.
"#,
    );

    /// Return a possibly colorized stdout, except the output supports elastic
    /// tabstops.
    pub fn elastic_stdout(&self) -> Box<dyn termcolor::WriteColor> {
        use {
            tabwriter::TabWriter,
            termcolor::{Ansi, NoColor},
        };

        if self.should_color() {
            Box::new(Ansi::new(TabWriter::new(std::io::stdout())))
        } else {
            Box::new(NoColor::new(TabWriter::new(std::io::stdout())))
        }
    }

    /// Return true if colors should be used. When the color choice is 'auto',
    /// this only returns true if stdout is a tty.
    pub fn should_color(&self) -> bool {
        match *self {
            Color::Auto => atty::is(atty::Stream::Stdout),
            Color::Always => true,
            Color::Never => false,
        }
    }
}

impl Default for Color {
    fn default() -> Color {
        Color::Auto
    }
}

impl std::str::FromStr for Color {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Color> {
        let color = match s {
            "auto" => Color::Auto,
            "always" => Color::Always,
            "never" => Color::Never,
            unknown => {
                anyhow::bail!(
                    "unrecognized color config '{}', must be \
                     one of auto, always or never.",
                    unknown,
                )
            }
        };
        Ok(color)
    }
}

/// The complete set of cell filters supported by commands that select cells.
#[derive(Clone, Debug, Default)]
pub struct Filters {
    /// A filter applied to the full cell name, 'task/scale/language'.
    pub name: Filter,
    /// A filter applied to the language (code generator) name.
    pub lang: Filter,
    /// A filter applied to the scale name.
    pub scale: Filter,
}

impl Filters {
    /// Returns true when a cell with the given name components passes every
    /// filter in this set.
    pub fn include(&self, name: &str, lang: &str, scale: &str) -> bool {
        self.name.include(name)
            && self.lang.include(lang)
            && self.scale.include(scale)
    }
}

/// Filter is the implementation of whitelist/blacklist rules. If there are no
/// rules, everything matches. If there's at least one whitelist rule, then
/// you need at least one whitelist rule to match to get through the filter.
/// If there are no whitelist regexes, then you can't match any of the
/// blacklist regexes.
///
/// This filter also has precedence built into it. That means that the order
/// of rules matters. So for example, if you have a whitelist regex that
/// matches AFTER a blacklist regex matches, then the input is considered to
/// have matched the filter.
#[derive(Clone, Debug, Default)]
pub struct Filter {
    rules: Vec<FilterRule>,
}

impl Filter {
    pub const USAGE_CELL: Usage = Usage::new(
        "-f, --filter <name> ...",
        "Filter by cell name.",
        r#"
Filter cells by name using regex.

This flag may be given multiple times. The value can either be a whitelist
regex or a blacklist regex. To make it a blacklist regex, start it with a '!'.
If there is at least one whitelist regex, then a cell must match at least one
of them in order to be included. If there are no whitelist regexes, then a
cell is only included when it does not match any blacklist regexes. The last
filter regex that matches (whether it be a whitelist or a blacklist) is what
takes precedence.

Filter regexes are matched on the full name of the cell, which takes the form
'{task}/{scale}/{language}'.
"#,
    );

    pub const USAGE_CELL_NOT: Usage = Usage::new(
        "-F, --filter-not <name> ...",
        "Filter by cell name, using a blacklist.",
        r#"
Filter cells by name using regex, using a blacklist.

This is the same as the -f/--filter flag, except it always adds the rule as a
blacklist rule. That is, '-F foo' is the same as '-f !foo'. It exists to
avoid needing shell quoting for the '!'.
"#,
    );

    pub const USAGE_LANG: Usage = Usage::new(
        "-e, --lang <language> ...",
        "Filter by language (code generator) name.",
        r#"
Filter cells by language name using regex.

This is just like the -f/--filter flag (with the same whitelist/blacklist
rules), except it applies to which code generators to include. It is useful,
for example, to measure a new artifact for only one of the languages without
re-running the other.
"#,
    );

    pub const USAGE_LANG_NOT: Usage = Usage::new(
        "-E, --lang-not <language> ...",
        "Filter by language name, using a blacklist.",
        r#"
Filter cells by language name using regex, using a blacklist.

This is the same as the -e/--lang flag, except it always adds the rule as a
blacklist rule.
"#,
    );

    pub const USAGE_SCALE: Usage = Usage::new(
        "-s, --scale <scale> ...",
        "Filter by scale name.",
        r#"
Filter cells by scale name using regex.

This is just like the -f/--filter flag (with the same whitelist/blacklist
rules), except it applies to which declared scales are measured. For example,
'-s small' restricts a run to the smallest declared workload sizes, which is
handy when checking that everything is wired up before committing to a long
measurement run.
"#,
    );

    pub const USAGE_SCALE_NOT: Usage = Usage::new(
        "-S, --scale-not <scale> ...",
        "Filter by scale name, using a blacklist.",
        r#"
Filter cells by scale name using regex, using a blacklist.

This is the same as the -s/--scale flag, except it always adds the rule as a
blacklist rule.
"#,
    );

    /// Parse the next flag value as a whitelist rule (unless it starts with
    /// '!') and add it to this filter.
    pub fn arg_whitelist(
        &mut self,
        p: &mut Parser,
        flag_name: &'static str,
    ) -> anyhow::Result<()> {
        let rule = parse(p, flag_name)?;
        self.add(rule);
        Ok(())
    }

    /// Parse the next flag value and add it to this filter as a blacklist
    /// rule, regardless of whether it starts with a '!' or not.
    pub fn arg_blacklist(
        &mut self,
        p: &mut Parser,
        flag_name: &'static str,
    ) -> anyhow::Result<()> {
        let mut rule: FilterRule = parse(p, flag_name)?;
        rule.blacklist = true;
        self.add(rule);
        Ok(())
    }

    /// Add the given rule to this filter.
    pub fn add(&mut self, rule: FilterRule) {
        self.rules.push(rule);
    }

    /// Return true if and only if the given subject passes this filter.
    pub fn include(&self, subject: &str) -> bool {
        // If we have no rules, then everything matches.
        if self.rules.is_empty() {
            return true;
        }
        // If we have any whitelist rules, then 'include' starts off as false,
        // as we need at least one whitelist rule in that case to match. If
        // all we have are blacklists though, then we start off with
        // include=true, and we only get excluded if one of those blacklists
        // is matched.
        let mut include = self.rules.iter().all(|r| r.blacklist);
        for rule in &self.rules {
            if rule.re.is_match(subject) {
                include = !rule.blacklist;
            }
        }
        include
    }
}

/// A single rule in a filter, which is a combination of a regex and whether
/// it's a blacklist rule or not.
#[derive(Clone, Debug)]
pub struct FilterRule {
    re: Regex,
    blacklist: bool,
}

impl std::str::FromStr for FilterRule {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<FilterRule> {
        let (pattern, blacklist) =
            if s.starts_with('!') { (&s[1..], true) } else { (&*s, false) };
        let re = Regex::new(pattern).context("filter regex is not valid")?;
        Ok(FilterRule { re, blacklist })
    }
}

/// A type for expressing the documentation of a flag.
///
/// The `Usage::short` and `Usage::long` functions take a slice of usages and
/// format them into a human readable display. It does simple word wrapping
/// and column alignment for you.
#[derive(Clone, Debug)]
pub struct Usage {
    /// The format of the flag, for example, '-c, --config <path>'.
    pub format: &'static str,
    /// A very short description of the flag. Should fit on one line along
    /// with the format.
    pub short: &'static str,
    /// A longer form description of the flag. May be multiple paragraphs
    /// long (but doesn't have to be).
    pub long: &'static str,
}

impl Usage {
    // We define some simpler and common flag usages right here directly.

    pub const CONFIG: Usage = Usage::new(
        "-c, --config <path>",
        "The run specification file.",
        r#"
The run specification file.

This is a TOML file declaring the global measurement parameters, the tasks,
languages and scales that make up the cells of the run, and the opaque
toolchain version strings recorded into meta.json.

The default for this value is 'wasmgauge.toml'.
"#,
    );

    pub const DIGESTS: Usage = Usage::new(
        "--digests <path>",
        "The reference digest file.",
        r#"
The reference digest file.

This is a TOML file mapping each (task, scale, seed) triple to the 32-bit
digest a correct workload implementation must produce. The digests are
computed offline; this harness only ever verifies against them. Entries may
instead mark a triple as exempt from digest checking, which is the escape
hatch for workloads whose floating point rounding differs across code
generators.

The default for this value is 'digests.toml'.
"#,
    );

    pub const ARTIFACTS: Usage = Usage::new(
        "-a, --artifacts <directory>",
        "The directory containing compiled WASM artifacts.",
        r#"
The directory containing compiled WASM artifacts.

The directory is scanned (recursively) for files named
'{task}-{language}-{scale}.wasm'. Every cell declared by the run
specification must have a corresponding artifact, otherwise the run is
rejected before any cell executes.

The default for this value is 'artifacts'.
"#,
    );

    pub const OUT_DIR: Usage = Usage::new(
        "-o, --out <directory>",
        "The directory in which run directories are created.",
        r#"
The directory in which run directories are created.

Each execution creates one directory named with a local timestamp, e.g.
'{out}/20250114T093042', containing raw.json, summary.json, comparisons.json
and meta.json.

The default for this value is 'runs'.
"#,
    );

    pub const MEASURE_ITERS: Usage = Usage::new(
        "--measure-iters <number>",
        "The number of measured iterations per cell.",
        r#"
The number of measured iterations to run for each cell.

Unlike adaptive harnesses, this harness runs a fixed number of iterations per
cell so that every cell contributes the same number of samples to the
statistics. Overriding the run specification from the command line is mostly
useful for quick smoke runs; note that pushing this below the configured
minimum sample count will get every cell rejected by the quality filter.
"#,
    );

    pub const WARMUP_ITERS: Usage = Usage::new(
        "--warmup-iters <number>",
        "The number of warmup iterations per cell.",
        r#"
The number of warmup iterations to run for each cell.

Warmup iterations execute and digest-verify the workload but produce no
samples. They exist to let JIT tiers, allocator pools and caches settle
before measurement begins, so that samples reflect steady state behavior.
"#,
    );

    pub const ITER_TIMEOUT: Usage = Usage::new(
        "--iter-timeout <duration>",
        "Fail a cell if a single iteration exceeds this.",
        r#"
Fail a cell if a single iteration exceeds this duration.

The timeout is enforced inside the measurement context, even when the guest
is stuck in an infinite loop. An iteration that exceeds it fails the entire
cell; samples collected before the offending iteration are retained.

The format for this flag is a duration specified in minutes, seconds,
milliseconds, microseconds or nanoseconds. Namely,
'^[0-9]+(m|s|ms|us|ns)$'.
"#,
    );

    pub const CONCURRENCY: Usage = Usage::new(
        "-j, --concurrency <number>",
        "The maximum number of cells measured in parallel.",
        r#"
The maximum number of cells measured in parallel.

Each in-flight cell owns one measurement context (and thus one WASM engine
instance). With a value of 1 the run is fully serial and deterministic.
Beware that measuring cells in parallel trades wall clock time for noise:
parallel cells compete for cores and caches, which inflates variance. The
quality filter will tell you when you've overdone it.
"#,
    );

    pub const RUN_TIMEOUT: Usage = Usage::new(
        "--run-timeout <duration>",
        "Abort the whole run if it exceeds this.",
        r#"
Abort the whole run if it exceeds this duration.

When the deadline passes, no new cells are dispatched and in-flight cells are
cancelled at their next iteration boundary. Partial batches are retained and
all persisted outputs are still written.
"#,
    );

    /// Create a new usage from the given components.
    pub const fn new(
        format: &'static str,
        short: &'static str,
        long: &'static str,
    ) -> Usage {
        Usage { format, short, long }
    }

    /// Format a two column table from the given usages, where the first
    /// column is the format and the second column is the short description.
    pub fn short(usages: &[Usage]) -> String {
        const MIN_SPACE: usize = 2;

        let mut result = String::new();
        let max_len = match usages.iter().map(|u| u.format.len()).max() {
            None => return result,
            Some(len) => len,
        };
        for usage in usages.iter() {
            let padlen = MIN_SPACE + (max_len - usage.format.len());
            let padding = " ".repeat(padlen);
            writeln!(result, "    {}{}{}", usage.format, padding, usage.short)
                .unwrap();
        }
        result
    }

    /// Print the format of each usage and its long description below the
    /// format. This also does appropriate indentation with the assumption
    /// that it is in an OPTIONS section of a bigger usage message.
    pub fn long(usages: &[Usage]) -> String {
        let wrap_opts = textwrap::Options::new(79)
            .initial_indent("        ")
            .subsequent_indent("        ");
        let mut result = String::new();
        for (i, usage) in usages.iter().enumerate() {
            if i > 0 {
                writeln!(result, "").unwrap();
            }
            writeln!(result, "    {}", usage.format).unwrap();
            for (i, paragraph) in usage.long.trim().split("\n\n").enumerate() {
                if i > 0 {
                    result.push('\n');
                }
                let flattened = paragraph.replace("\n", " ");
                for line in textwrap::wrap(&flattened, &wrap_opts) {
                    result.push_str(&line);
                    result.push('\n');
                }
            }
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filter_whitelist_and_blacklist() {
        let mut f = Filter::default();
        f.add("mandelbrot".parse().unwrap());
        assert!(f.include("mandelbrot/small/rust"));
        assert!(!f.include("matmul/small/rust"));

        let mut f = Filter::default();
        f.add("!tinygo".parse().unwrap());
        assert!(f.include("mandelbrot/small/rust"));
        assert!(!f.include("mandelbrot/small/tinygo"));
    }

    #[test]
    fn filter_precedence_is_last_match() {
        // Blacklist 'ma', then whitelist 'matmul' again: matmul passes
        // because the later rule wins.
        let mut f = Filter::default();
        f.add(".".parse().unwrap());
        f.add("!ma".parse().unwrap());
        f.add("matmul".parse().unwrap());
        assert!(f.include("json-parse/small/rust"));
        assert!(!f.include("mandelbrot/small/rust"));
        assert!(f.include("matmul/small/rust"));
    }

    #[test]
    fn empty_filter_includes_everything() {
        let f = Filter::default();
        assert!(f.include("anything/at/all"));
    }
}
