use std::{
    fs,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
};

use camino::{Utf8Path, Utf8PathBuf};
use kiln_engine::{EdgeKind, WorkGraphBuilder};
use kiln_history::MemoryHistoryStore;
use kiln_lib::{ConfigurationOptions, KilnConfigBuilder, Run, RunBuilder};
use kiln_run_summary::RunSummary;
use kiln_snapshot::{InputProperty, NormalizationStrategy};
use kiln_types::{NodeId, NodeState, SkipReason, WorkOutcome};
use kiln_work::{ActionContext, ActionError, FnAction, NodeDescriptor};
use pretty_assertions::assert_eq;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

struct Project {
    _dir: TempDir,
    root: Utf8PathBuf,
}

impl Project {
    fn new() -> anyhow::Result<Self> {
        let dir = tempfile::tempdir()?;
        let root = Utf8PathBuf::try_from(dir.path().to_path_buf())?;
        fs::create_dir_all(root.join("src"))?;
        fs::write(root.join("src/Main.java"), "class Main {}")?;
        fs::create_dir_all(root.join("test"))?;
        fs::write(root.join("test/MainTest.java"), "class MainTest {}")?;
        Ok(Self { _dir: dir, root })
    }

    fn config(&self) -> anyhow::Result<ConfigurationOptions> {
        Ok(KilnConfigBuilder::new(&self.root)
            .with_environment(Default::default())
            .with_concurrency(2)
            .build()?)
    }
}

#[derive(Default, Clone)]
struct Counters {
    compile: Arc<AtomicUsize>,
    test: Arc<AtomicUsize>,
    package: Arc<AtomicUsize>,
}

impl Counters {
    fn get(&self) -> [usize; 3] {
        [&self.compile, &self.test, &self.package].map(|c| c.load(Ordering::SeqCst))
    }
}

fn outcome(summary: &RunSummary, id: &str) -> Option<WorkOutcome> {
    summary.node(id).and_then(|node| node.outcome)
}

/// compile -> test -> packageJar, each reading the previous step's outputs.
fn java_build(
    root: &Utf8Path,
    counters: &Counters,
) -> anyhow::Result<WorkGraphBuilder<NodeDescriptor>> {
    let compile_runs = counters.compile.clone();
    let compile = NodeDescriptor::task(
        "compile",
        root,
        FnAction::new("javac", move |context: &ActionContext<'_>| {
            compile_runs.fetch_add(1, Ordering::SeqCst);
            let classes = &context.output("classes").expect("declared")[0];
            fs::create_dir_all(classes)?;
            let source = fs::read_to_string(context.working_dir().join("src/Main.java"))?;
            fs::write(classes.join("Main.class"), format!("bytecode({source})"))?;
            Ok(())
        }),
    )
    .input(
        "sources",
        InputProperty::new(["src"], NormalizationStrategy::RelativePath),
    )
    .output("classes", ["build/classes"])
    .cacheable(true);

    let test_runs = counters.test.clone();
    let test = NodeDescriptor::task(
        "test",
        root,
        FnAction::new("junit", move |context: &ActionContext<'_>| {
            test_runs.fetch_add(1, Ordering::SeqCst);
            let report = &context.output("results").expect("declared")[0];
            fs::create_dir_all(report.parent().expect("has parent"))?;
            fs::write(report, "<testsuite tests=\"1\" failures=\"0\"/>")?;
            Ok(())
        }),
    )
    .input(
        "classes",
        InputProperty::new(["build/classes"], NormalizationStrategy::RelativePath),
    )
    .input(
        "testSources",
        InputProperty::new(["test"], NormalizationStrategy::RelativePath),
    )
    .output("results", ["build/test-results/TEST-Main.xml"]);

    let package_runs = counters.package.clone();
    let package = NodeDescriptor::task(
        "packageJar",
        root,
        FnAction::new("jar", move |context: &ActionContext<'_>| {
            package_runs.fetch_add(1, Ordering::SeqCst);
            let jar = &context.output("jar").expect("declared")[0];
            fs::create_dir_all(jar.parent().expect("has parent"))?;
            let class =
                fs::read_to_string(context.working_dir().join("build/classes/Main.class"))?;
            fs::write(jar, format!("jar[{class}]"))?;
            Ok(())
        }),
    )
    .input(
        "classes",
        InputProperty::new(["build/classes"], NormalizationStrategy::RelativePath),
    )
    .output("jar", ["build/libs/app.jar"]);

    let mut builder = WorkGraphBuilder::<NodeDescriptor>::new();
    builder.add_node("compile", compile)?;
    builder.add_node("test", test)?;
    builder.add_node("packageJar", package)?;
    builder.add_edge("test", "compile", EdgeKind::Dependency);
    builder.add_edge("packageJar", "test", EdgeKind::Dependency);
    Ok(builder)
}

fn failing(id: &str, root: &Utf8Path, message: &'static str) -> NodeDescriptor {
    NodeDescriptor::task(
        id,
        root,
        FnAction::new(id, move |_: &ActionContext<'_>| Err(ActionError::failed(message))),
    )
}

fn succeeding(id: &str, root: &Utf8Path) -> NodeDescriptor {
    NodeDescriptor::task(id, root, FnAction::new(id, |_: &ActionContext<'_>| Ok(())))
}

#[tokio::test]
async fn test_java_build_is_incremental() -> anyhow::Result<()> {
    let project = Project::new()?;
    let counters = Counters::default();
    let graph = java_build(&project.root, &counters)?.finalize()?;
    let run = RunBuilder::new(&project.root, project.config()?).build(graph)?;

    let first = run.run(&[NodeId::new("packageJar")], &[]).await?;
    for id in ["compile", "test", "packageJar"] {
        assert_eq!(outcome(&first, id), Some(WorkOutcome::Executed), "{id}");
    }
    assert_eq!(first.exit_code(), 0);
    assert_eq!(
        fs::read_to_string(project.root.join("build/libs/app.jar"))?,
        "jar[bytecode(class Main {})]"
    );

    let second = run.run(&[NodeId::new("packageJar")], &[]).await?;
    for id in ["compile", "test", "packageJar"] {
        assert_eq!(outcome(&second, id), Some(WorkOutcome::UpToDate), "{id}");
    }
    assert_eq!(counters.get(), [1, 1, 1]);
    assert_eq!(second.execution().up_to_date, 3);

    fs::write(project.root.join("src/Main.java"), "class Main { int x; }")?;
    let third = run.run(&[NodeId::new("packageJar")], &[]).await?;
    for id in ["compile", "test", "packageJar"] {
        assert_eq!(outcome(&third, id), Some(WorkOutcome::Executed), "{id}");
    }
    assert_eq!(
        third.node("compile").map(|node| node.reasons.clone()),
        Some(vec![
            "input property 'sources': src/Main.java has changed".to_string()
        ])
    );
    assert_eq!(counters.get(), [2, 2, 2]);
    Ok(())
}

#[tokio::test]
async fn test_changes_only_rerun_affected_nodes() -> anyhow::Result<()> {
    let project = Project::new()?;
    let counters = Counters::default();
    let graph = java_build(&project.root, &counters)?.finalize()?;
    let run = RunBuilder::new(&project.root, project.config()?).build(graph)?;
    run.run(&[], &[]).await?;

    // packageJar only reads the classes, not the test results.
    fs::write(project.root.join("test/MainTest.java"), "class MainTest { void t() {} }")?;
    let summary = run.run(&[], &[]).await?;
    assert_eq!(outcome(&summary, "compile"), Some(WorkOutcome::UpToDate));
    assert_eq!(outcome(&summary, "test"), Some(WorkOutcome::Executed));
    assert_eq!(outcome(&summary, "packageJar"), Some(WorkOutcome::UpToDate));
    assert_eq!(counters.get(), [1, 2, 1]);
    Ok(())
}

#[tokio::test]
async fn test_requesting_a_dependency_leaves_dependents_alone() -> anyhow::Result<()> {
    let project = Project::new()?;
    let counters = Counters::default();
    let graph = java_build(&project.root, &counters)?.finalize()?;
    let run = RunBuilder::new(&project.root, project.config()?).build(graph)?;

    let summary = run.run(&[NodeId::new("compile")], &[]).await?;
    assert_eq!(summary.nodes().len(), 1);
    assert_eq!(counters.get(), [1, 0, 0]);
    Ok(())
}

#[tokio::test]
async fn test_clean_checkout_restores_from_cache() -> anyhow::Result<()> {
    let project = Project::new()?;
    let counters = Counters::default();

    let graph = java_build(&project.root, &counters)?.finalize()?;
    let run = RunBuilder::new(&project.root, project.config()?)
        .with_history_store(Arc::new(MemoryHistoryStore::new()))
        .build(graph)?;
    run.run(&[NodeId::new("compile")], &[]).await?;

    // Same build cache, but no outputs and no history.
    fs::remove_dir_all(project.root.join("build"))?;
    let graph = java_build(&project.root, &counters)?.finalize()?;
    let run = RunBuilder::new(&project.root, project.config()?)
        .with_history_store(Arc::new(MemoryHistoryStore::new()))
        .build(graph)?;
    let summary = run.run(&[NodeId::new("compile")], &[]).await?;

    assert_eq!(outcome(&summary, "compile"), Some(WorkOutcome::FromCache));
    assert_eq!(counters.get(), [1, 0, 0]);
    assert_eq!(
        fs::read_to_string(project.root.join("build/classes/Main.class"))?,
        "bytecode(class Main {})"
    );
    Ok(())
}

#[tokio::test]
async fn test_failure_only_skips_dependents() -> anyhow::Result<()> {
    let project = Project::new()?;
    let mut builder = WorkGraphBuilder::<NodeDescriptor>::new();
    builder.add_node("a", failing("a", &project.root, "compilation failed: 1 error"))?;
    builder.add_node("b", succeeding("b", &project.root))?;
    builder.add_node("c", succeeding("c", &project.root))?;
    builder.add_edge("c", "a", EdgeKind::Dependency);
    let run = RunBuilder::new(&project.root, project.config()?).build(builder.finalize()?)?;

    let summary = run.run(&[], &[]).await?;

    let a = summary.node("a").expect("a ran");
    assert_eq!(a.state, NodeState::Failed);
    assert_eq!(a.failure.as_deref(), Some("compilation failed: 1 error"));
    assert_eq!(outcome(&summary, "b"), Some(WorkOutcome::Executed));

    let c = summary.node("c").expect("c is reported");
    assert_eq!(c.state, NodeState::Skipped);
    assert_eq!(
        c.skipped_because,
        Some(SkipReason::DependencyFailed {
            dependency: NodeId::new("a")
        })
    );
    assert_eq!(c.causal_chain, vec![NodeId::new("a")]);
    assert_eq!(summary.exit_code(), 1);
    assert_eq!(summary.execution().failed, 1);
    assert_eq!(summary.execution().skipped, 1);
    Ok(())
}

#[cfg(unix)]
#[tokio::test]
async fn test_unreadable_input_fails_its_node() -> anyhow::Result<()> {
    let project = Project::new()?;
    // A link to itself can never be read, whoever runs the build.
    std::os::unix::fs::symlink(
        project.root.join("src/Broken.java"),
        project.root.join("src/Broken.java"),
    )?;
    let counters = Counters::default();
    let mut builder = java_build(&project.root, &counters)?;
    builder.add_node("javadoc", succeeding("javadoc", &project.root))?;
    let run = RunBuilder::new(&project.root, project.config()?).build(builder.finalize()?)?;

    let summary = run.run(&[], &[]).await?;

    let compile = summary.node("compile").expect("compile is reported");
    assert_eq!(compile.state, NodeState::Failed);
    let failure = compile.failure.as_deref().unwrap_or_default();
    assert!(
        failure.contains("property 'sources'"),
        "unexpected failure: {failure}"
    );
    assert!(failure.contains("Broken.java"), "unexpected failure: {failure}");
    assert_eq!(
        summary.node("test").and_then(|node| node.skipped_because.clone()),
        Some(SkipReason::DependencyFailed {
            dependency: NodeId::new("compile")
        })
    );
    assert_eq!(
        summary.node("packageJar").and_then(|node| node.skipped_because.clone()),
        Some(SkipReason::DependencyFailed {
            dependency: NodeId::new("test")
        })
    );
    assert_eq!(outcome(&summary, "javadoc"), Some(WorkOutcome::Executed));
    assert_eq!(counters.get(), [0, 0, 0]);
    assert_eq!(summary.exit_code(), 1);
    Ok(())
}

#[tokio::test]
async fn test_failed_work_is_never_up_to_date() -> anyhow::Result<()> {
    let project = Project::new()?;
    let runs = Arc::new(AtomicUsize::new(0));
    let counted = runs.clone();
    let check = NodeDescriptor::task(
        "check",
        &project.root,
        FnAction::new("check", move |context: &ActionContext<'_>| {
            counted.fetch_add(1, Ordering::SeqCst);
            let source = fs::read_to_string(context.working_dir().join("src/Main.java"))?;
            if source.contains("error") {
                return Err(ActionError::failed("syntax error"));
            }
            fs::create_dir_all(context.working_dir().join("build"))?;
            fs::write(context.working_dir().join("build/check.txt"), "ok")?;
            Ok(())
        }),
    )
    .input(
        "sources",
        InputProperty::new(["src"], NormalizationStrategy::RelativePath),
    )
    .output("report", ["build/check.txt"]);

    let mut builder = WorkGraphBuilder::<NodeDescriptor>::new();
    builder.add_node("check", check)?;
    let run = RunBuilder::new(&project.root, project.config()?).build(builder.finalize()?)?;

    fs::write(project.root.join("src/Main.java"), "class Main { error }")?;
    assert_eq!(run.run(&[], &[]).await?.exit_code(), 1);
    assert_eq!(run.run(&[], &[]).await?.exit_code(), 1);
    assert_eq!(runs.load(Ordering::SeqCst), 2);

    fs::write(project.root.join("src/Main.java"), "class Main {}")?;
    let fixed = run.run(&[], &[]).await?;
    assert_eq!(outcome(&fixed, "check"), Some(WorkOutcome::Executed));
    let again = run.run(&[], &[]).await?;
    assert_eq!(outcome(&again, "check"), Some(WorkOutcome::UpToDate));
    assert_eq!(runs.load(Ordering::SeqCst), 3);
    Ok(())
}

#[tokio::test]
async fn test_soft_cycle_is_broken() -> anyhow::Result<()> {
    let project = Project::new()?;
    let mut builder = WorkGraphBuilder::<NodeDescriptor>::new();
    builder.add_node("a", succeeding("a", &project.root))?;
    builder.add_node("b", succeeding("b", &project.root))?;
    builder.add_edge("a", "b", EdgeKind::ShouldRunAfter);
    builder.add_edge("b", "a", EdgeKind::ShouldRunAfter);
    let run = RunBuilder::new(&project.root, project.config()?).build(builder.finalize()?)?;

    assert_eq!(
        run.graph().dropped_soft_edges(),
        &[(NodeId::new("a"), NodeId::new("b"))]
    );
    let summary = run.run(&[], &[]).await?;
    assert_eq!(outcome(&summary, "a"), Some(WorkOutcome::Executed));
    assert_eq!(outcome(&summary, "b"), Some(WorkOutcome::Executed));
    Ok(())
}

#[tokio::test]
async fn test_cancelled_run_skips_everything() -> anyhow::Result<()> {
    let project = Project::new()?;
    let counters = Counters::default();
    let graph = java_build(&project.root, &counters)?.finalize()?;

    let token = CancellationToken::new();
    token.cancel();
    let run: Run = RunBuilder::new(&project.root, project.config()?)
        .with_cancellation(token)
        .build(graph)?;

    let summary = run.run(&[], &[]).await?;
    assert_eq!(summary.nodes().len(), 3);
    for node in summary.nodes() {
        assert_eq!(node.skipped_because, Some(SkipReason::Cancelled), "{}", node.id);
    }
    assert_eq!(summary.exit_code(), 130);
    assert_eq!(counters.get(), [0, 0, 0]);
    Ok(())
}
