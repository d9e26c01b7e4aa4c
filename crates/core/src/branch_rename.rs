//! Automatic branch naming from session titles.
//!
//! New worktrees start on a generated `adjective-animal` branch. Once the
//! agent gives the session a real title, the branch is renamed to a slug of
//! that title. The rename runs at most once per worktree; after a success
//! or a hard failure the worktree is flagged and left alone.

use tracing::{info, warn};

use paddock_protocol::{WorktreeFields, WorktreeRecord};

use crate::traits::WorktreeGit;

const MAX_SLUG_WORDS: usize = 5;
const MAX_SLUG_LEN: usize = 40;
/// Probes `slug`, then `slug-2` through `slug-9`.
const MAX_RENAME_ATTEMPTS: u32 = 9;

const PLACEHOLDER_ADJECTIVES: &[&str] = &[
    "brave", "calm", "clever", "crimson", "curious", "dapper", "eager", "fuzzy", "gentle",
    "golden", "happy", "jolly", "lively", "lucky", "mellow", "nimble", "plucky", "proud",
    "quiet", "rapid", "silver", "sunny", "swift", "witty",
];

const PLACEHOLDER_ANIMALS: &[&str] = &[
    "badger", "beagle", "bison", "corgi", "falcon", "ferret", "finch", "gecko", "heron",
    "lemur", "lynx", "marmot", "meerkat", "otter", "panda", "puffin", "quokka", "rabbit",
    "raccoon", "retriever", "sparrow", "tapir", "walrus", "wombat",
];

/// What the rename attempt did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum RenameOutcome {
    Renamed { from: String, to: String },
    /// Preconditions not met. Nothing was recorded, so a later title can
    /// still trigger a rename.
    Skipped,
    /// The rename failed or every candidate name was taken. The worktree
    /// is flagged so we stop trying.
    GaveUp,
}

/// Rename the session's worktree branch after its title, if all the
/// preconditions hold: a worktree exists, it has not been renamed before,
/// the title is real, and the branch is still the generated placeholder.
pub(crate) async fn rename_for_title(
    git: &dyn WorktreeGit,
    client_session_id: &str,
    title: &str,
) -> RenameOutcome {
    if is_placeholder_title(title) {
        return RenameOutcome::Skipped;
    }
    let worktree = match git.worktree_for_session(client_session_id).await {
        Ok(Some(worktree)) => worktree,
        Ok(None) => return RenameOutcome::Skipped,
        Err(err) => {
            warn!(
                component = "branch_rename",
                event = "branch_rename.lookup_failed",
                client_session_id = %client_session_id,
                error = %err,
                "Worktree lookup failed"
            );
            return RenameOutcome::Skipped;
        }
    };
    if worktree.branch_renamed {
        return RenameOutcome::Skipped;
    }
    if !is_placeholder_branch(&worktree.branch_name) {
        return RenameOutcome::Skipped;
    }

    let slug = slugify_title(title);
    if slug.is_empty() || slug == worktree.branch_name {
        return RenameOutcome::Skipped;
    }

    let mut target = None;
    for attempt in 1..=MAX_RENAME_ATTEMPTS {
        let candidate = if attempt == 1 {
            slug.clone()
        } else {
            format!("{slug}-{attempt}")
        };
        match git.branch_exists(&candidate).await {
            Ok(false) => {
                target = Some(candidate);
                break;
            }
            Ok(true) => {}
            Err(err) => {
                warn!(
                    component = "branch_rename",
                    event = "branch_rename.probe_failed",
                    candidate = %candidate,
                    error = %err,
                    "Branch existence probe failed"
                );
                return give_up(git, &worktree).await;
            }
        }
    }
    let Some(target) = target else {
        warn!(
            component = "branch_rename",
            event = "branch_rename.exhausted",
            slug = %slug,
            "Every candidate branch name is taken"
        );
        return give_up(git, &worktree).await;
    };

    if let Err(err) = git
        .rename_branch(&worktree.path, &worktree.branch_name, &target)
        .await
    {
        warn!(
            component = "branch_rename",
            event = "branch_rename.failed",
            from = %worktree.branch_name,
            to = %target,
            error = %err,
            "Branch rename failed"
        );
        return give_up(git, &worktree).await;
    }

    let fields = WorktreeFields {
        branch_name: Some(target.clone()),
        branch_renamed: Some(true),
    };
    if let Err(err) = git.update_worktree(&worktree.id, fields).await {
        warn!(
            component = "branch_rename",
            event = "branch_rename.record_failed",
            worktree_id = %worktree.id,
            error = %err,
            "Renamed the branch but could not record it"
        );
    }
    info!(
        component = "branch_rename",
        event = "branch_rename.renamed",
        client_session_id = %client_session_id,
        from = %worktree.branch_name,
        to = %target,
        "Renamed worktree branch after session title"
    );
    RenameOutcome::Renamed {
        from: worktree.branch_name,
        to: target,
    }
}

/// Flag the worktree so no further rename is attempted.
async fn give_up(git: &dyn WorktreeGit, worktree: &WorktreeRecord) -> RenameOutcome {
    let fields = WorktreeFields {
        branch_name: None,
        branch_renamed: Some(true),
    };
    if let Err(err) = git.update_worktree(&worktree.id, fields).await {
        warn!(
            component = "branch_rename",
            event = "branch_rename.flag_failed",
            worktree_id = %worktree.id,
            error = %err,
            "Could not flag worktree after failed rename"
        );
    }
    RenameOutcome::GaveUp
}

/// Turn a session title into a branch-friendly slug: lowercase, runs of
/// non-alphanumerics collapsed to single dashes, at most the first five
/// words and forty characters, no edge dashes.
pub fn slugify_title(title: &str) -> String {
    let head = title
        .split_whitespace()
        .take(MAX_SLUG_WORDS)
        .collect::<Vec<_>>()
        .join(" ");
    let mut slug = String::new();
    for c in head.chars() {
        if c.is_ascii_alphanumeric() {
            slug.push(c.to_ascii_lowercase());
        } else if !slug.is_empty() && !slug.ends_with('-') {
            slug.push('-');
        }
    }
    while slug.ends_with('-') {
        slug.pop();
    }
    slug.truncate(MAX_SLUG_LEN);
    while slug.ends_with('-') {
        slug.pop();
    }
    slug
}

/// Titles that are still the server's boilerplate rather than a real name.
pub fn is_placeholder_title(title: &str) -> bool {
    let trimmed = title.trim();
    if trimmed.is_empty() {
        return true;
    }
    let lower = trimmed.to_ascii_lowercase();
    lower.starts_with("untitled") || lower == "new session"
}

/// Matches the generated `adjective-animal` branch names, allowing the
/// numeric suffix that collision handling appends.
pub fn is_placeholder_branch(branch: &str) -> bool {
    let lower = branch.to_ascii_lowercase();
    let mut parts = lower.split('-');
    let (Some(adjective), Some(animal)) = (parts.next(), parts.next()) else {
        return false;
    };
    match parts.next() {
        None => {}
        Some(suffix) if !suffix.is_empty() && suffix.chars().all(|c| c.is_ascii_digit()) => {
            if parts.next().is_some() {
                return false;
            }
        }
        Some(_) => return false,
    }
    PLACEHOLDER_ADJECTIVES.contains(&adjective) && PLACEHOLDER_ANIMALS.contains(&animal)
}

/// Pick a placeholder branch name for a new worktree.
pub fn placeholder_branch() -> String {
    let seed = paddock_protocol::time::now_ms() as u64;
    let adjective = PLACEHOLDER_ADJECTIVES[(seed / 97) as usize % PLACEHOLDER_ADJECTIVES.len()];
    let animal = PLACEHOLDER_ANIMALS[seed as usize % PLACEHOLDER_ANIMALS.len()];
    format!("{adjective}-{animal}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::FakeGit;

    #[test]
    fn slugify_lowercases_and_dashes() {
        assert_eq!(slugify_title("Auth Setup Guide"), "auth-setup-guide");
        assert_eq!(slugify_title("  Fix:  the (bug)!  "), "fix-the-bug");
        assert_eq!(slugify_title("___"), "");
    }

    #[test]
    fn slugify_keeps_first_five_words_and_forty_chars() {
        assert_eq!(
            slugify_title("one two three four five six seven"),
            "one-two-three-four-five"
        );
        let long = slugify_title("supercalifragilistic expialidocious refactoring extravaganza");
        assert!(long.len() <= 40);
        assert!(!long.ends_with('-'));
    }

    #[test]
    fn placeholder_titles_are_detected() {
        assert!(is_placeholder_title(""));
        assert!(is_placeholder_title("  Untitled 3"));
        assert!(is_placeholder_title("New Session"));
        assert!(!is_placeholder_title("Auth setup guide"));
    }

    #[test]
    fn placeholder_branches_are_detected() {
        assert!(is_placeholder_branch("golden-retriever"));
        assert!(is_placeholder_branch("Golden-Retriever"));
        assert!(is_placeholder_branch("golden-retriever-2"));
        assert!(!is_placeholder_branch("auth-setup-guide"));
        assert!(!is_placeholder_branch("main"));
        assert!(!is_placeholder_branch("golden-retriever-fix"));
    }

    #[test]
    fn generated_placeholder_is_recognized_by_the_detector() {
        assert!(is_placeholder_branch(&placeholder_branch()));
    }

    #[tokio::test]
    async fn renames_placeholder_branch_to_title_slug() {
        let git = FakeGit::default();
        git.add_worktree("cs-1", "golden-retriever");

        let outcome = rename_for_title(&git, "cs-1", "Auth Setup Guide").await;
        assert_eq!(
            outcome,
            RenameOutcome::Renamed {
                from: "golden-retriever".to_string(),
                to: "auth-setup-guide".to_string(),
            }
        );
        let worktree = git.worktree("cs-1").expect("worktree");
        assert_eq!(worktree.branch_name, "auth-setup-guide");
        assert!(worktree.branch_renamed);
    }

    #[tokio::test]
    async fn title_matching_branch_is_left_alone_without_flag() {
        let git = FakeGit::default();
        git.add_worktree("cs-1", "golden-retriever");

        let outcome = rename_for_title(&git, "cs-1", "Golden Retriever").await;
        assert_eq!(outcome, RenameOutcome::Skipped);
        let worktree = git.worktree("cs-1").expect("worktree");
        assert_eq!(worktree.branch_name, "golden-retriever");
        // The flag stays clear so a better title can still rename.
        assert!(!worktree.branch_renamed);
    }

    #[tokio::test]
    async fn collision_takes_the_first_free_suffix() {
        let git = FakeGit::default();
        git.add_worktree("cs-1", "golden-retriever");
        git.add_branch("auth-setup-guide");
        git.add_branch("auth-setup-guide-2");

        let outcome = rename_for_title(&git, "cs-1", "Auth Setup Guide").await;
        assert_eq!(
            outcome,
            RenameOutcome::Renamed {
                from: "golden-retriever".to_string(),
                to: "auth-setup-guide-3".to_string(),
            }
        );
    }

    #[tokio::test]
    async fn exhausted_candidates_flag_the_worktree() {
        let git = FakeGit::default();
        git.add_worktree("cs-1", "golden-retriever");
        git.add_branch("auth-setup-guide");
        for suffix in 2..=9 {
            git.add_branch(&format!("auth-setup-guide-{suffix}"));
        }

        let outcome = rename_for_title(&git, "cs-1", "Auth Setup Guide").await;
        assert_eq!(outcome, RenameOutcome::GaveUp);
        let worktree = git.worktree("cs-1").expect("worktree");
        assert_eq!(worktree.branch_name, "golden-retriever");
        assert!(worktree.branch_renamed);
    }

    #[tokio::test]
    async fn hard_rename_failure_flags_the_worktree() {
        let git = FakeGit::default();
        git.add_worktree("cs-1", "golden-retriever");
        git.fail_renames();

        let outcome = rename_for_title(&git, "cs-1", "Auth Setup Guide").await;
        assert_eq!(outcome, RenameOutcome::GaveUp);
        assert!(git.worktree("cs-1").expect("worktree").branch_renamed);
    }

    #[tokio::test]
    async fn custom_branch_and_placeholder_title_are_skipped() {
        let git = FakeGit::default();
        git.add_worktree("cs-1", "my-own-branch");
        assert_eq!(
            rename_for_title(&git, "cs-1", "Auth Setup Guide").await,
            RenameOutcome::Skipped
        );

        let git = FakeGit::default();
        git.add_worktree("cs-2", "golden-retriever");
        assert_eq!(
            rename_for_title(&git, "cs-2", "Untitled 2").await,
            RenameOutcome::Skipped
        );
        assert!(!git.worktree("cs-2").expect("worktree").branch_renamed);
    }

    #[tokio::test]
    async fn session_without_worktree_is_skipped() {
        let git = FakeGit::default();
        assert_eq!(
            rename_for_title(&git, "cs-none", "Auth Setup Guide").await,
            RenameOutcome::Skipped
        );
    }

    #[tokio::test]
    async fn renamed_worktree_is_not_touched_again() {
        let git = FakeGit::default();
        git.add_worktree("cs-1", "golden-retriever");
        rename_for_title(&git, "cs-1", "Auth Setup Guide").await;

        let outcome = rename_for_title(&git, "cs-1", "A Completely Different Title").await;
        assert_eq!(outcome, RenameOutcome::Skipped);
        assert_eq!(
            git.worktree("cs-1").expect("worktree").branch_name,
            "auth-setup-guide"
        );
    }
}
