use std::path::PathBuf;
use std::str::FromStr;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use harness::store::ResultStore;
use harness::BenchmarkKind;
use tracing::info;
use tracing_subscriber::EnvFilter;

use aug_agents::config::RunConfig;
use aug_agents::runs::{self, aug, eval, fix, judge, must_cover, mutation, test_gen, RunContext};
use aug_agents::stages::stage1::{Stage1Config, Stage1Orchestrator};
use aug_agents::stages::stage2::{Stage2Config, Stage2Orchestrator};
use aug_agents::stages::stage3::{Stage3Config, Stage3Orchestrator};

#[derive(Parser)]
#[command(
    name = "aug-agents",
    about = "Agent pipelines for generating, mutating, and augmenting regression-test suites"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

/// Flags shared by every subcommand.
#[derive(Args, Clone)]
struct CommonArgs {
    /// Run output directory (holds preds.json, traj/, logs/, …).
    #[arg(long, short = 'o')]
    output: PathBuf,
    /// Benchmark family.
    #[arg(long, default_value = "swebench")]
    benchmark: String,
    /// Worker pool size.
    #[arg(long, short = 'w', default_value_t = 2)]
    workers: usize,
    /// Comma-separated instance ids to restrict the pass to.
    #[arg(long, value_delimiter = ',')]
    instance_ids: Vec<String>,
    /// File listing instance ids, one per line.
    #[arg(long)]
    run_instance_file: Option<PathBuf>,
}

#[derive(Args, Clone)]
struct AgentArgs {
    /// Agent/model YAML config file.
    #[arg(long)]
    agent_config: Option<PathBuf>,
    /// Model name override.
    #[arg(long, short = 'm')]
    model: Option<String>,
    /// Sampling temperature override.
    #[arg(long)]
    temperature: Option<f64>,
}

#[derive(Subcommand)]
enum Command {
    /// Stage 1 orchestrator: test_gen → hard_code_fix → gold_eval →
    /// coverage_fix → coverage_eval.
    Stage1(Stage1Args),
    /// Stage 2 orchestrator: mutation_gen → init_test → judge, per set.
    MutationGen(Stage2Args),
    /// Stage 3 orchestrator: merge → aug_no_equ → aug_equ.
    MutationAug(Stage3Args),

    /// Worker pass: generate tests for instances.
    TestGen(TestGenArgs),
    /// Worker pass: fix an existing test patch (hard-code or coverage).
    Fix(FixArgs),
    /// Worker pass: container evaluation (gold / init-test / mutation / aug).
    Eval(EvalArgs),
    /// Worker pass: extract must-cover line sets.
    MustCover(MustCoverArgs),
    /// Worker pass: generate mutations into a set directory.
    Mutation(MutationArgs),
    /// Worker pass: judge mutations with majority voting.
    Judge(JudgeArgs),
    /// Worker pass: augment tests against a target mutation.
    Aug(AugArgs),
}

#[derive(Args)]
struct Stage1Args {
    #[command(flatten)]
    common: CommonArgs,
    #[command(flatten)]
    agent: AgentArgs,
    /// Dataset export with the benchmark instances.
    #[arg(long)]
    dataset: PathBuf,
    /// Per-instance run scripts directory.
    #[arg(long)]
    scripts_dir: PathBuf,
    #[arg(long, default_value = "stage1_auto")]
    run_id: String,
    #[arg(long, default_value_t = 12)]
    eval_workers: usize,
    #[arg(long)]
    must_cover_file: Option<PathBuf>,
    #[arg(long, default_value_t = 3)]
    max_test_gen_retries: u32,
    #[arg(long, default_value_t = 3)]
    max_hard_code_fix_retries: u32,
    #[arg(long, default_value_t = 2)]
    max_combined_retries: u32,
    #[arg(long)]
    skip_coverage_fix: bool,
    /// Resume from a phase in the fixed order.
    #[arg(long)]
    start_from_phase: Option<String>,
}

#[derive(Args)]
struct Stage2Args {
    #[command(flatten)]
    common: CommonArgs,
    #[command(flatten)]
    agent: AgentArgs,
    /// Stage 1 preds.json with the final test patches.
    #[arg(long)]
    stage1_preds: PathBuf,
    #[arg(long)]
    scripts_dir: PathBuf,
    #[arg(long, default_value = "stage2_mutation")]
    run_id: String,
    #[arg(long, default_value_t = 12)]
    eval_workers: usize,
    /// Number of mutation sets (set1 … setN).
    #[arg(long, default_value_t = 2)]
    required_mutations: u32,
    #[arg(long, default_value_t = 5)]
    max_mutation_gen_iterations: u32,
    /// Judge models (comma separated); a single model is repeated.
    #[arg(long, value_delimiter = ',')]
    judge_models: Vec<String>,
    #[arg(long, default_value_t = 3)]
    judge_times: usize,
    #[arg(long)]
    start_from_phase: Option<String>,
}

#[derive(Args)]
struct Stage3Args {
    #[command(flatten)]
    common: CommonArgs,
    #[command(flatten)]
    agent: AgentArgs,
    #[arg(long)]
    stage1_preds: PathBuf,
    /// Stage 2 output directory containing set1/ … setN/.
    #[arg(long)]
    stage2_output: PathBuf,
    #[arg(long)]
    scripts_dir: PathBuf,
    #[arg(long, default_value = "stage3_aug")]
    run_id: String,
    #[arg(long, default_value_t = 12)]
    eval_workers: usize,
    #[arg(long, default_value_t = 2)]
    required_mutations: u32,
    #[arg(long, default_value_t = 2)]
    max_aug_retries: u32,
    #[arg(long)]
    start_from_phase: Option<String>,
}

#[derive(Args)]
struct TestGenArgs {
    #[command(flatten)]
    common: CommonArgs,
    #[command(flatten)]
    agent: AgentArgs,
    #[arg(long)]
    dataset: PathBuf,
    #[arg(long)]
    scripts_dir: PathBuf,
    /// Generation round number.
    #[arg(long, default_value_t = 0)]
    iteration: u32,
}

#[derive(Args)]
struct FixArgs {
    #[command(flatten)]
    common: CommonArgs,
    #[command(flatten)]
    agent: AgentArgs,
    #[arg(long)]
    scripts_dir: PathBuf,
    /// `Hard_Code_Fix` or `Coverage_Fix`.
    #[arg(long)]
    fix_type: String,
}

#[derive(Args)]
struct EvalArgs {
    #[command(flatten)]
    common: CommonArgs,
    #[arg(long)]
    scripts_dir: PathBuf,
    #[arg(long)]
    run_id: String,
    /// gold | init-test | mutation | aug
    #[arg(long)]
    mode: String,
    /// Input preds document; defaults to `<output>/preds.json`.
    #[arg(long)]
    dataset: Option<PathBuf>,
    /// Output preds document for mutation/aug modes.
    #[arg(long)]
    preds_out: Option<PathBuf>,
    /// Mutation set preds for the merge (comma separated).
    #[arg(long, value_delimiter = ',')]
    mutation_paths: Vec<PathBuf>,
    #[arg(long)]
    coverage: bool,
    #[arg(long)]
    must_cover_file: Option<PathBuf>,
    #[arg(long)]
    redo: bool,
    #[arg(long)]
    block_network: bool,
    #[arg(long, default_value = "8g")]
    mem_limit: String,
    #[arg(long, default_value_t = 480)]
    timeout: u64,
    /// Container platform override (e.g. linux/amd64 on ARM hosts).
    #[arg(long)]
    platform: Option<String>,
    /// Aug-eval bookkeeping.
    #[arg(long)]
    stage_name: Option<String>,
    #[arg(long, default_value_t = 0)]
    iteration: u32,
}

#[derive(Args)]
struct MustCoverArgs {
    #[command(flatten)]
    common: CommonArgs,
    #[arg(long)]
    dataset: PathBuf,
    #[arg(long)]
    scripts_dir: PathBuf,
    /// Accumulated must-cover document.
    #[arg(long)]
    must_cover_file: PathBuf,
}

#[derive(Args)]
struct MutationArgs {
    #[command(flatten)]
    common: CommonArgs,
    #[command(flatten)]
    agent: AgentArgs,
    #[arg(long)]
    dataset: PathBuf,
    #[arg(long)]
    scripts_dir: PathBuf,
    #[arg(long, default_value_t = 1)]
    set_index: u32,
}

#[derive(Args)]
struct JudgeArgs {
    #[command(flatten)]
    common: CommonArgs,
    #[command(flatten)]
    agent: AgentArgs,
    #[arg(long, value_delimiter = ',')]
    judge_models: Vec<String>,
    #[arg(long, default_value_t = 3)]
    judge_times: usize,
}

#[derive(Args)]
struct AugArgs {
    #[command(flatten)]
    common: CommonArgs,
    #[command(flatten)]
    agent: AgentArgs,
    #[arg(long)]
    dataset: PathBuf,
    #[arg(long)]
    scripts_dir: PathBuf,
    /// `no_equ_mutation_aug` or `equ_mutation_aug`.
    #[arg(long)]
    stage_name: String,
    #[arg(long, default_value_t = 0)]
    iteration: u32,
    /// Regenerate instances that already have an aug result.
    #[arg(long)]
    redo_fail_instances: bool,
}

fn init_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
}

fn run_config(agent: &AgentArgs) -> Result<RunConfig> {
    let mut config = match &agent.agent_config {
        Some(path) => RunConfig::load(path)?,
        None => RunConfig::default(),
    };
    if let Some(model) = &agent.model {
        match &mut config.model {
            Some(model_config) => model_config.model_name = model.clone(),
            None => {
                config.model = Some(aug_agents::model::HttpModelConfig {
                    base_url: std::env::var("AUG_AGENTS_BASE_URL")
                        .unwrap_or_else(|_| "http://localhost:8080/v1".to_string()),
                    model_name: model.clone(),
                    api_key_env: "OPENAI_API_KEY".to_string(),
                    temperature: None,
                    input_cost_per_mtok: 0.0,
                    output_cost_per_mtok: 0.0,
                })
            }
        }
    }
    if let (Some(temperature), Some(model_config)) = (agent.temperature, config.model.as_mut()) {
        model_config.temperature = Some(temperature);
    }
    Ok(config)
}

fn context(common: &CommonArgs, agent: &AgentArgs, scripts_dir: &PathBuf) -> Result<RunContext> {
    Ok(RunContext::new(
        common.output.clone(),
        BenchmarkKind::from_str(&common.benchmark)?,
        common.workers,
        run_config(agent)?,
        scripts_dir.clone(),
    ))
}

/// Load a pass's input records honouring the selection flags.
fn selected_records(path: &std::path::Path, common: &CommonArgs) -> Result<Vec<serde_json::Value>> {
    let records = runs::load_instances(path)?;
    runs::select_instances(
        records,
        &common.instance_ids,
        common.run_instance_file.as_deref(),
    )
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();
    let cli = Cli::parse();

    let ok = match cli.command {
        Command::Stage1(args) => {
            let config = Stage1Config {
                output_dir: args.common.output.join(&args.run_id),
                dataset: args.dataset,
                scripts_dir: args.scripts_dir,
                agent_config: args
                    .agent
                    .agent_config
                    .clone()
                    .context("--agent-config is required for stage1")?,
                model: args.agent.model.clone().context("--model is required")?,
                benchmark: args.common.benchmark.clone(),
                workers: args.common.workers,
                eval_workers: args.eval_workers,
                run_id: args.run_id,
                must_cover_file: args.must_cover_file,
                max_test_gen_retries: args.max_test_gen_retries,
                max_hard_code_fix_retries: args.max_hard_code_fix_retries,
                max_combined_retries: args.max_combined_retries,
                enable_coverage_fix: !args.skip_coverage_fix,
                start_from_phase: args.start_from_phase,
            };
            Stage1Orchestrator::new(config)?.run().await?
        }
        Command::MutationGen(args) => {
            let config = Stage2Config {
                output_dir: args.common.output.join(&args.run_id),
                stage1_preds: args.stage1_preds,
                scripts_dir: args.scripts_dir,
                agent_config: args
                    .agent
                    .agent_config
                    .clone()
                    .context("--agent-config is required for mutation-gen")?,
                model: args.agent.model.clone().context("--model is required")?,
                judge_models: args.judge_models,
                judge_times: args.judge_times,
                benchmark: args.common.benchmark.clone(),
                workers: args.common.workers,
                eval_workers: args.eval_workers,
                run_id: args.run_id,
                required_mutations: args.required_mutations,
                max_mutation_gen_iterations: args.max_mutation_gen_iterations,
                start_from_phase: args.start_from_phase,
            };
            Stage2Orchestrator::new(config)?.run().await?
        }
        Command::MutationAug(args) => {
            let config = Stage3Config {
                output_dir: args.common.output.join(&args.run_id),
                stage1_preds: args.stage1_preds,
                stage2_output_dir: args.stage2_output,
                scripts_dir: args.scripts_dir,
                agent_config: args
                    .agent
                    .agent_config
                    .clone()
                    .context("--agent-config is required for mutation-aug")?,
                model: args.agent.model.clone().context("--model is required")?,
                benchmark: args.common.benchmark.clone(),
                workers: args.common.workers,
                eval_workers: args.eval_workers,
                run_id: args.run_id,
                required_mutations: args.required_mutations,
                max_aug_retries: args.max_aug_retries,
                start_from_phase: args.start_from_phase,
            };
            Stage3Orchestrator::new(config)?.run().await?
        }

        Command::TestGen(args) => {
            let ctx = context(&args.common, &args.agent, &args.scripts_dir)?;
            let records = selected_records(&args.dataset, &args.common)?;
            test_gen::run(&ctx, records, args.iteration).await? > 0
        }
        Command::Fix(args) => {
            let ctx = context(&args.common, &args.agent, &args.scripts_dir)?;
            let kind = fix::FixKind::from_str(&args.fix_type)?;
            let records = selected_records(&ctx.preds_path(), &args.common)?;
            // Only instances that actually carry tests are fixable.
            let records: Vec<_> = records
                .into_iter()
                .filter(|r| {
                    r.get("model_test_patch")
                        .and_then(serde_json::Value::as_str)
                        .map(|p| !p.trim().is_empty())
                        .unwrap_or(false)
                })
                .collect();
            fix::run(&ctx, records, kind).await?;
            true
        }
        Command::Eval(args) => run_eval(args).await?,
        Command::MustCover(args) => {
            let agent = AgentArgs {
                agent_config: None,
                model: None,
                temperature: None,
            };
            let ctx = context(&args.common, &agent, &args.scripts_dir)?;
            let records = selected_records(&args.dataset, &args.common)?;
            must_cover::run(&ctx, records, &args.must_cover_file).await? > 0
        }
        Command::Mutation(args) => {
            let ctx = context(&args.common, &args.agent, &args.scripts_dir)?;
            let records = selected_records(&args.dataset, &args.common)?;
            // Mutations are only generated for instances whose tests pass on
            // gold.
            let records: Vec<_> = records
                .into_iter()
                .filter(|r| {
                    r.get("meta")
                        .and_then(|m| m.get("pass_gold_patch_status"))
                        .and_then(serde_json::Value::as_str)
                        == Some("success")
                })
                .collect();
            mutation::run(&ctx, records, args.set_index).await?;
            true
        }
        Command::Judge(args) => {
            let scripts_dir = PathBuf::new();
            let ctx = context(&args.common, &args.agent, &scripts_dir)?;
            let preds_path = ctx.preds_path();
            let records = selected_records(&preds_path, &args.common)?;
            // Judge only mutations that survived their init test and have no
            // verdict yet.
            let records: Vec<_> = records
                .into_iter()
                .filter(|r| {
                    let survived = r
                        .get("evaluation_info")
                        .and_then(|e| e.get("pass_init_test_status"))
                        .and_then(serde_json::Value::as_str)
                        == Some("success");
                    survived && r.get("judge_info").is_none()
                })
                .collect();
            let options = judge::JudgeOptions {
                models: args.judge_models,
                judge_times: args.judge_times,
            };
            judge::run(&ctx, &preds_path, records, &options).await?;
            true
        }
        Command::Aug(args) => {
            let ctx = context(&args.common, &args.agent, &args.scripts_dir)?;
            let records = selected_records(&args.dataset, &args.common)?;
            let options = aug::AugOptions {
                stage_name: args.stage_name,
                iteration: args.iteration,
            };
            // Without the redo flag, instances that already produced an aug
            // patch in this iteration are skipped.
            let records = if args.redo_fail_instances {
                records
            } else {
                let preds_out = args
                    .common
                    .output
                    .join(format!("preds_{}.json", options.save_name()));
                let done: Vec<String> = ResultStore::new(&preds_out)?
                    .load()
                    .iter()
                    .filter(|(_, r)| {
                        r.get("model_test_patch")
                            .and_then(serde_json::Value::as_str)
                            .map(|p| !p.trim().is_empty())
                            .unwrap_or(false)
                    })
                    .map(|(id, _)| id.clone())
                    .collect();
                records
                    .into_iter()
                    .filter(|r| {
                        r.get("instance_id")
                            .and_then(serde_json::Value::as_str)
                            .map(|id| !done.iter().any(|d| d == id))
                            .unwrap_or(false)
                    })
                    .collect()
            };
            aug::run(&ctx, records, &options).await?;
            true
        }
    };

    info!(success = ok, "run finished");
    std::process::exit(if ok { 0 } else { 1 });
}

async fn run_eval(args: EvalArgs) -> Result<bool> {
    let agent = AgentArgs {
        agent_config: None,
        model: None,
        temperature: None,
    };
    let ctx = context(&args.common, &agent, &args.scripts_dir)?;

    let options = eval::EvalOptions {
        mode: match args.mode.as_str() {
            "gold" => eval::EvalMode::Gold {
                coverage: args.coverage,
            },
            "init-test" => eval::EvalMode::InitTest,
            "mutation" => eval::EvalMode::Mutation,
            "aug" => eval::EvalMode::Aug,
            other => anyhow::bail!("unknown eval mode '{other}'"),
        },
        run_id: args.run_id.clone(),
        redo: args.redo,
        block_network: args.block_network,
        mem_limit: args.mem_limit.clone(),
        timeout_secs: args.timeout,
        platform: args.platform.clone(),
        must_cover_file: args.must_cover_file.clone(),
        stage_name: args.stage_name.clone(),
        iteration: args.iteration,
    };

    let input_path = args
        .dataset
        .clone()
        .unwrap_or_else(|| ctx.preds_path());
    let records = selected_records(&input_path, &args.common)?;

    let (records, writeback_path) = match options.mode {
        eval::EvalMode::Gold { coverage } => {
            // Gold mode targets the current failures (or, with coverage, the
            // low-coverage subset) unless an explicit selection was given.
            let records = if !args.common.instance_ids.is_empty()
                || args.common.run_instance_file.is_some()
            {
                records
            } else {
                let store = ResultStore::new(&input_path)?;
                let targets: Vec<String> = if coverage {
                    store.get_low_coverage_instances(1.0)
                } else {
                    store.get_gold_patch_failures()
                };
                records
                    .into_iter()
                    .filter(|r| {
                        r.get("instance_id")
                            .and_then(serde_json::Value::as_str)
                            .map(|id| targets.iter().any(|t| t == id))
                            .unwrap_or(false)
                    })
                    .collect()
            };
            // Instances without tests cannot be evaluated.
            let records: Vec<_> = records
                .into_iter()
                .filter(|r| {
                    r.get("model_test_patch")
                        .and_then(serde_json::Value::as_str)
                        .map(|p| !p.trim().is_empty())
                        .unwrap_or(false)
                })
                .collect();
            (records, input_path.clone())
        }
        eval::EvalMode::InitTest => {
            // A set record without a mutation fails its init test by
            // definition; only real patches go through a container.
            let (with_patch, empty): (Vec<_>, Vec<_>) =
                records.into_iter().partition(|r| {
                    r.get("model_patch")
                        .and_then(serde_json::Value::as_str)
                        .map(|p| !p.trim().is_empty())
                        .unwrap_or(false)
                });
            let store = ResultStore::new(&input_path)?;
            for record in empty {
                if let Some(id) = record.get("instance_id").and_then(serde_json::Value::as_str) {
                    store.update_instance(
                        id,
                        serde_json::json!({"evaluation_info": {
                            "status": "completed",
                            "pass_init_test_status": "fail",
                        }}),
                        true,
                    )?;
                }
            }
            (with_patch, input_path.clone())
        }
        eval::EvalMode::Mutation => {
            let merged = eval::assemble_mutation_records(records, &args.mutation_paths)?;
            let out = args
                .preds_out
                .clone()
                .context("--preds-out is required for mutation mode")?;
            (merged, out)
        }
        eval::EvalMode::Aug => {
            // Instances whose aug generation produced nothing keep their old
            // mutation_info and fall back into the retry loop.
            let records: Vec<_> = records
                .into_iter()
                .filter(|r| {
                    r.get("model_test_patch")
                        .and_then(serde_json::Value::as_str)
                        .map(|p| !p.trim().is_empty())
                        .unwrap_or(false)
                })
                .collect();
            let out = args.preds_out.clone().unwrap_or_else(|| input_path.clone());
            (records, out)
        }
    };

    let stats = eval::run_with_writeback(&ctx, &writeback_path, records, &options).await?;
    Ok(stats.error == 0 || stats.pass > 0)
}
