use std::fmt::Write as _;
use std::fs;
use std::io::{self, Read};
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Args, Subcommand};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use unicode_segmentation::UnicodeSegmentation;

use crate::browse::{BrowseMode, BrowseRequest, BrowseResult, Browser, PageSpecifier};
use crate::config::AppConfig;
use crate::dialog::RenderedLine;
use crate::quotes::{
    Account, DraftOptions, DuplicateCandidate, Quote, QuoteBook, QuoteId, QuoteUpdate,
};

const PREVIEW_GRAPHEMES: usize = 72;

#[derive(Args, Debug, Clone)]
pub struct AccountArgs {
    #[command(subcommand)]
    pub command: AccountCommand,
}

#[derive(Subcommand, Debug, Clone)]
pub enum AccountCommand {
    /// Register a new account name
    Create(AccountNameArgs),
    /// Print an account and its counters
    Show(AccountNameArgs),
}

#[derive(Args, Debug, Clone)]
pub struct AccountNameArgs {
    pub name: String,
}

/// Where dialog text comes from. Falls back to stdin when it is piped.
#[derive(Args, Debug, Clone, Default)]
pub struct DialogInput {
    /// Dialog text given inline
    #[arg(long, conflicts_with = "file")]
    pub text: Option<String>,
    /// Read dialog text from a file
    #[arg(long)]
    pub file: Option<PathBuf>,
}

#[derive(Args, Debug, Clone)]
pub struct SubmitArgs {
    /// Account submitting the quote
    #[arg(long = "as", value_name = "ACCOUNT")]
    pub account: String,
    #[command(flatten)]
    pub input: DialogInput,
    /// Free-text note stored alongside the quote
    #[arg(long)]
    pub note: Option<String>,
    /// Keep the text verbatim, skipping timestamp and nick detection
    #[arg(long)]
    pub preserve_formatting: bool,
    /// Publish straight away instead of leaving a draft
    #[arg(long)]
    pub publish: bool,
}

#[derive(Args, Debug, Clone)]
pub struct UpdateArgs {
    /// Draft identifier
    pub id: QuoteId,
    #[arg(long = "as", value_name = "ACCOUNT")]
    pub account: String,
    #[command(flatten)]
    pub input: DialogInput,
    /// Replace the note
    #[arg(long, conflicts_with = "clear_note")]
    pub note: Option<String>,
    /// Remove the note
    #[arg(long)]
    pub clear_note: bool,
    /// Turn verbatim formatting on
    #[arg(long, conflicts_with = "parse_formatting")]
    pub preserve_formatting: bool,
    /// Turn timestamp and nick detection back on
    #[arg(long)]
    pub parse_formatting: bool,
    /// Publish the draft after updating it
    #[arg(long)]
    pub publish: bool,
}

#[derive(Args, Debug, Clone)]
pub struct QuoteRefArgs {
    /// Quote identifier
    pub id: QuoteId,
    #[arg(long = "as", value_name = "ACCOUNT")]
    pub account: String,
}

#[derive(Args, Debug, Clone)]
pub struct ShowArgs {
    /// Quote identifier
    pub id: QuoteId,
    /// Viewer; needed to see your own drafts
    #[arg(long = "as", value_name = "ACCOUNT")]
    pub account: Option<String>,
}

#[derive(Args, Debug, Clone)]
pub struct BrowseArgs {
    /// Cursor printed by a previous browse call
    #[arg(long)]
    pub page: Option<String>,
    /// Listing used when no cursor is given
    #[arg(long, default_value = "recent")]
    pub mode: BrowseMode,
    /// Quotes per page for a fresh listing
    #[arg(long)]
    pub size: Option<usize>,
    /// Viewer; required for draft listings
    #[arg(long = "as", value_name = "ACCOUNT")]
    pub account: Option<String>,
    /// Only quotes submitted by this account
    #[arg(long)]
    pub owner: Option<String>,
    /// Only quotes carrying this label, e.g. nick:bob
    #[arg(long)]
    pub label: Option<String>,
    /// Full-text query for search listings
    #[arg(long)]
    pub query: Option<String>,
}

#[derive(Args, Debug, Clone)]
pub struct DuplicatesArgs {
    /// Stored quote to check; omit to check new text instead
    pub id: Option<QuoteId>,
    #[command(flatten)]
    pub input: DialogInput,
    #[arg(long)]
    pub preserve_formatting: bool,
    /// Defaults to duplicates.max_results from the config
    #[arg(long)]
    pub limit: Option<usize>,
}

pub fn account(book: &QuoteBook, args: AccountArgs) -> Result<String> {
    match args.command {
        AccountCommand::Create(args) => {
            let account = book
                .create_account(&args.name)
                .with_context(|| format!("creating account {:?}", args.name.trim()))?;
            Ok(format!("Created account #{} ({})\n", account.id, account.name))
        }
        AccountCommand::Show(args) => {
            let account = resolve_account(book, &args.name)?;
            Ok(format_account(&account))
        }
    }
}

pub fn submit(book: &QuoteBook, config: &AppConfig, args: SubmitArgs) -> Result<String> {
    let account = resolve_account(book, &args.account)?;
    let Some(source) = read_dialog(&args.input)? else {
        bail!("no dialog given; use --text, --file or pipe it on stdin");
    };
    let options = DraftOptions {
        preserve_formatting: args.preserve_formatting || config.submit.preserve_formatting,
        note: args.note.filter(|note| !note.trim().is_empty()),
        submitted: None,
    };
    let draft = book.create_draft(account.id, &source, options)?;

    let mut out = String::new();
    let duplicates = book.find_duplicates(draft.id, config.duplicates.max_results)?;
    if !duplicates.is_empty() {
        out.push_str("Possible duplicates:\n");
        out.push_str(&format_duplicates(&duplicates));
    }

    if args.publish {
        let quote = book.publish(account.id, draft.id, None)?;
        let _ = writeln!(&mut out, "Published quote #{}", quote.id);
    } else {
        let _ = writeln!(&mut out, "Saved draft #{}", draft.id);
    }
    Ok(out)
}

pub fn update(book: &QuoteBook, args: UpdateArgs) -> Result<String> {
    let account = resolve_account(book, &args.account)?;
    let note = if args.clear_note {
        Some(None)
    } else {
        args.note.map(Some)
    };
    let preserve_formatting = if args.preserve_formatting {
        Some(true)
    } else if args.parse_formatting {
        Some(false)
    } else {
        None
    };
    let changes = QuoteUpdate {
        dialog: read_dialog(&args.input)?,
        preserve_formatting,
        note,
        publish: args.publish,
        modified: None,
    };
    let quote = book.update(account.id, args.id, changes)?;
    if quote.draft {
        Ok(format!("Updated draft #{}\n", quote.id))
    } else {
        Ok(format!("Published quote #{}\n", quote.id))
    }
}

pub fn publish(book: &QuoteBook, args: QuoteRefArgs) -> Result<String> {
    let account = resolve_account(book, &args.account)?;
    let quote = book.publish(account.id, args.id, None)?;
    if quote.id == args.id {
        Ok(format!("Published quote #{}\n", quote.id))
    } else {
        Ok(format!("Applied edit #{} to quote #{}\n", args.id, quote.id))
    }
}

pub fn edit(book: &QuoteBook, args: QuoteRefArgs) -> Result<String> {
    let account = resolve_account(book, &args.account)?;
    let draft = book.edit(account.id, args.id)?;
    Ok(format!(
        "Editing quote #{} as draft #{}; publish the draft to apply it\n",
        args.id, draft.id
    ))
}

pub fn discard(book: &QuoteBook, args: QuoteRefArgs) -> Result<String> {
    let account = resolve_account(book, &args.account)?;
    book.discard_draft(account.id, args.id)?;
    Ok(format!("Discarded draft #{}\n", args.id))
}

pub fn delete(book: &QuoteBook, args: QuoteRefArgs) -> Result<String> {
    let account = resolve_account(book, &args.account)?;
    book.unpublish(account.id, args.id)?;
    Ok(format!("Deleted quote #{}\n", args.id))
}

pub fn show(book: &QuoteBook, args: ShowArgs) -> Result<String> {
    let viewer = args
        .account
        .as_deref()
        .map(|name| resolve_account(book, name))
        .transpose()?;
    let quote = book.get_quote(viewer.map(|account| account.id), args.id)?;
    Ok(format_quote(&quote))
}

pub fn browse(book: &QuoteBook, config: &AppConfig, args: BrowseArgs) -> Result<String> {
    let viewer = lookup_optional(book, args.account.as_deref())?;
    let owner = lookup_optional(book, args.owner.as_deref())?;
    let mut default_page = PageSpecifier::new(args.mode.as_ref());
    if let Some(size) = args.size {
        default_page = default_page.with_size(size);
    }
    let request = BrowseRequest {
        page: args.page,
        viewer: viewer.map(|account| account.id),
        owner: owner.map(|account| account.id),
        label: args.label,
        query: args.query,
    };
    // An explicit cursor that fails to decode is reported, not replaced.
    let fallback = request.page.is_none().then_some(&default_page);
    let result = Browser::new(book, &config.search).browse(&request, fallback)?;
    Ok(format_browse(&result))
}

pub fn duplicates(book: &QuoteBook, config: &AppConfig, args: DuplicatesArgs) -> Result<String> {
    let limit = args.limit.unwrap_or(config.duplicates.max_results);
    let found = match args.id {
        Some(id) => book.find_duplicates(id, limit)?,
        None => {
            let Some(source) = read_dialog(&args.input)? else {
                bail!("give a quote id or dialog text to compare");
            };
            book.find_duplicates_of(&source, args.preserve_formatting, limit)?
        }
    };
    if found.is_empty() {
        return Ok("No duplicates found.\n".to_string());
    }
    Ok(format_duplicates(&found))
}

fn resolve_account(book: &QuoteBook, name: &str) -> Result<Account> {
    book.account_by_name(name)?
        .with_context(|| format!("account {:?} not found", name.trim()))
}

fn lookup_optional(book: &QuoteBook, name: Option<&str>) -> Result<Option<Account>> {
    name.map(|name| resolve_account(book, name)).transpose()
}

fn read_dialog(input: &DialogInput) -> Result<Option<String>> {
    if let Some(text) = &input.text {
        return Ok(Some(text.clone()));
    }
    if let Some(path) = &input.file {
        let text = fs::read_to_string(path)
            .with_context(|| format!("reading dialog from {}", path.display()))?;
        return Ok(Some(text));
    }
    read_stdin()
}

fn read_stdin() -> Result<Option<String>> {
    if atty::is(atty::Stream::Stdin) {
        return Ok(None);
    }
    let mut buf = String::new();
    io::stdin().read_to_string(&mut buf)?;
    Ok(Some(buf).filter(|text| !text.trim().is_empty()))
}

fn format_account(account: &Account) -> String {
    let mut out = String::new();
    let _ = writeln!(&mut out, "#{}  {}", account.id, account.name);
    let _ = writeln!(&mut out, "    quotes  {}", account.quote_count);
    let _ = writeln!(&mut out, "    drafts  {}", account.draft_count);
    let _ = writeln!(&mut out, "    since   {}", format_timestamp(account.created_at));
    out
}

fn format_quote(quote: &Quote) -> String {
    let mut out = String::new();
    let _ = writeln!(&mut out, "#{}  [{}]", quote.id, quote.state());
    let _ = writeln!(&mut out, "    submitted {}", format_timestamp(quote.submitted));
    if let Some(modified) = quote.modified {
        let _ = writeln!(&mut out, "    modified  {}", format_timestamp(modified));
    }
    if !quote.labels.is_empty() {
        let _ = writeln!(&mut out, "    labels    {}", quote.labels.join(" "));
    }
    if let Some(note) = &quote.note {
        let _ = writeln!(&mut out, "    note      {note}");
    }
    out.push('\n');
    for line in quote.dialog() {
        let _ = writeln!(&mut out, "  {}", format_line(&line));
    }
    out
}

fn format_line(line: &RenderedLine) -> String {
    let mut rendered = String::new();
    if let Some(time) = line.timestamp() {
        let _ = write!(&mut rendered, "[{:02}:{:02}] ", time.hour(), time.minute());
    }
    if let Some(actor) = line.actor() {
        let _ = write!(&mut rendered, "<{actor}> ");
    }
    rendered.push_str(&line.text);
    rendered
}

fn format_browse(result: &BrowseResult) -> String {
    let mut out = String::new();
    if result.quotes.is_empty() {
        out.push_str("No quotes on this page.\n");
    }
    for quote in &result.quotes {
        let _ = writeln!(&mut out, "{}", format_summary(quote));
    }
    if let Some(next) = &result.next_page {
        let _ = writeln!(&mut out, "next: {next}");
    }
    if let Some(prev) = &result.prev_page {
        let _ = writeln!(&mut out, "prev: {prev}");
    }
    out
}

fn format_duplicates(found: &[DuplicateCandidate]) -> String {
    let mut out = String::new();
    for candidate in found {
        let plural = if candidate.shared == 1 { "" } else { "s" };
        let _ = writeln!(
            &mut out,
            "{}  ({} shared line{plural})",
            format_summary(&candidate.quote),
            candidate.shared
        );
    }
    out
}

fn format_summary(quote: &Quote) -> String {
    let preview = quote
        .dialog()
        .first()
        .map(format_line)
        .map(|line| truncate_graphemes(&line, PREVIEW_GRAPHEMES))
        .unwrap_or_default();
    let mut headline = format!("#{}  {}", quote.id, preview);
    if quote.draft {
        headline.push_str("  [DRAFT]");
    }
    headline
}

fn truncate_graphemes(text: &str, max: usize) -> String {
    let mut graphemes = text.graphemes(true);
    let head: String = graphemes.by_ref().take(max).collect();
    if graphemes.next().is_some() {
        format!("{head}…")
    } else {
        head
    }
}

fn format_timestamp(value: OffsetDateTime) -> String {
    value
        .format(&Rfc3339)
        .unwrap_or_else(|_| value.unix_timestamp().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::RecordingSink;
    use crate::storage::tests::init_storage;
    use tempfile::TempDir;

    type TestResult<T = ()> = Result<T>;

    fn setup() -> TestResult<(TempDir, QuoteBook)> {
        let (temp, storage) = init_storage()?;
        let book = QuoteBook::new(storage, RecordingSink::new());
        book.create_account("logan")?;
        Ok((temp, book))
    }

    fn text(dialog: &str) -> DialogInput {
        DialogInput {
            text: Some(dialog.to_string()),
            file: None,
        }
    }

    fn submit_args(dialog: &str, publish: bool) -> SubmitArgs {
        SubmitArgs {
            account: "logan".into(),
            input: text(dialog),
            note: None,
            preserve_formatting: false,
            publish,
        }
    }

    #[test]
    fn cli_submit_publish_and_show() -> TestResult {
        let (_temp, book) = setup()?;
        let config = AppConfig::default();
        let output = submit(
            &book,
            &config,
            submit_args("[09:15] <bob> who left the coffee on\n[09:16] <amy> the coffee left itself on", true),
        )?;
        assert_eq!(output, "Published quote #1\n");

        let shown = show(&book, ShowArgs { id: 1, account: None })?;
        assert!(shown.starts_with("#1  [published]"));
        assert!(shown.contains("labels    nick:amy nick:bob"));
        assert!(shown.contains("  [09:15] <bob> who left the coffee on\n"));
        Ok(())
    }

    #[test]
    fn cli_submit_reports_duplicates() -> TestResult {
        let (_temp, book) = setup()?;
        let config = AppConfig::default();
        submit(&book, &config, submit_args("<bob> who left the coffee on again", true))?;
        let output = submit(&book, &config, submit_args("(10:00) <Bob> who left the coffee on again", false))?;
        assert!(output.starts_with("Possible duplicates:\n#1  <bob> who left the coffee on again  (1 shared line)\n"));
        assert!(output.ends_with("Saved draft #2\n"));
        Ok(())
    }

    #[test]
    fn cli_edit_then_publish_applies_the_edit() -> TestResult {
        let (_temp, book) = setup()?;
        let config = AppConfig::default();
        submit(&book, &config, submit_args("<bob> the first version of this line", true))?;
        let output = edit(&book, QuoteRefArgs { id: 1, account: "logan".into() })?;
        assert!(output.contains("as draft #2"));

        let output = update(
            &book,
            UpdateArgs {
                id: 2,
                account: "logan".into(),
                input: text("<bob> the second version of this line"),
                note: None,
                clear_note: false,
                preserve_formatting: false,
                parse_formatting: false,
                publish: true,
            },
        )?;
        assert_eq!(output, "Published quote #1\n");
        let shown = show(&book, ShowArgs { id: 1, account: None })?;
        assert!(shown.contains("second version"));
        Ok(())
    }

    #[test]
    fn cli_drafts_are_private() -> TestResult {
        let (_temp, book) = setup()?;
        book.create_account("robin")?;
        submit(&book, &AppConfig::default(), submit_args("<amy> a draft nobody should see", false))?;
        assert!(show(&book, ShowArgs { id: 1, account: Some("robin".into()) }).is_err());
        assert!(show(&book, ShowArgs { id: 1, account: None }).is_err());
        let own = show(&book, ShowArgs { id: 1, account: Some("logan".into()) })?;
        assert!(own.starts_with("#1  [draft]"));
        Ok(())
    }

    #[test]
    fn cli_browse_prints_cursors() -> TestResult {
        let (_temp, book) = setup()?;
        let config = AppConfig::default();
        for n in 0..3 {
            submit(&book, &config, submit_args(&format!("<bob> message number {n} in the log"), true))?;
        }
        let args = BrowseArgs {
            page: None,
            mode: BrowseMode::Recent,
            size: Some(2),
            account: None,
            owner: None,
            label: Some("nick:bob".into()),
            query: None,
        };
        let output = browse(&book, &config, args.clone())?;
        let lines: Vec<&str> = output.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].starts_with("#3  <bob> message number 2"));
        assert!(lines[2].starts_with("next: m=recent;d="));

        let bad = BrowseArgs {
            page: Some("m=recent;o=x".into()),
            ..args
        };
        assert!(browse(&book, &config, bad).is_err());
        Ok(())
    }

    #[test]
    fn cli_unknown_account_is_an_error() -> TestResult {
        let (_temp, book) = setup()?;
        let err = publish(&book, QuoteRefArgs { id: 1, account: "nobody".into() })
            .expect_err("unknown account");
        assert!(err.to_string().contains("\"nobody\" not found"));
        Ok(())
    }

    #[test]
    fn previews_truncate_on_grapheme_boundaries() {
        assert_eq!(truncate_graphemes("héllo wörld", 5), "héllo…");
        assert_eq!(truncate_graphemes("short", 10), "short");
    }
}
