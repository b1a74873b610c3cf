use std::io::{self, ErrorKind, Write};
use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use serde_json::Value;
use undertone_contracts::analysis::{AnalysisInput, AnalysisResult, TimelineCue, MAX_TEXT_CHARS};
use undertone_contracts::chat::{parse_intent, CHAT_HELP_COMMANDS};
use undertone_contracts::scenarios::ScenarioCatalog;
use undertone_engine::{SessionHandle, SubtextEngine, DEFAULT_MODEL};

#[derive(Debug, Parser)]
#[command(name = "undertone", version, about = "听懂言外之意：对话潜台词解码")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// One-shot analysis of a text snippet or media file.
    Analyze(AnalyzeArgs),
    /// Interactive session: analyze, then ask follow-up questions.
    Chat(ChatArgs),
    /// List the scenario presets.
    Scenarios,
}

#[derive(Debug, Parser)]
struct AnalyzeArgs {
    /// Raw conversation text to decode.
    #[arg(long, conflicts_with = "file")]
    text: Option<String>,
    /// Audio or video file to decode.
    #[arg(long)]
    file: Option<PathBuf>,
    /// MIME type of --file; inferred from the extension when omitted.
    #[arg(long, requires = "file")]
    mime: Option<String>,
    #[arg(long, default_value = "workplace_meeting")]
    scenario: String,
    /// Extra background context for the analysis.
    #[arg(long)]
    background: Option<String>,
    #[arg(long, default_value = DEFAULT_MODEL)]
    model: String,
    /// Append lifecycle events to this JSONL file.
    #[arg(long)]
    events: Option<PathBuf>,
    /// Print the raw report JSON instead of the rendered report.
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Parser)]
struct ChatArgs {
    #[arg(long, default_value = "workplace_meeting")]
    scenario: String,
    #[arg(long)]
    background: Option<String>,
    #[arg(long, default_value = DEFAULT_MODEL)]
    model: String,
    #[arg(long)]
    events: Option<PathBuf>,
}

fn main() {
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("undertone error: {err:#}");
            std::process::exit(1);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    match cli.command {
        Command::Analyze(args) => run_analyze(args),
        Command::Chat(args) => run_chat(args),
        Command::Scenarios => {
            print_scenarios(&ScenarioCatalog::default());
            Ok(0)
        }
    }
}

fn run_analyze(args: AnalyzeArgs) -> Result<i32> {
    let Some(input) = collect_input(args.text.as_deref(), args.file.clone(), args.mime.clone())?
    else {
        eprintln!("请通过 --text 或 --file 提供要分析的内容。");
        return Ok(2);
    };

    let mut engine = SubtextEngine::new(Some(args.model), args.events);
    match engine.analyze(&input, &args.scenario, args.background.as_deref()) {
        Ok(result) => {
            if args.json {
                println!("{}", serde_json::to_string_pretty(&result)?);
            } else {
                print_report(&result, engine.last_warnings());
            }
            Ok(0)
        }
        Err(err) => {
            eprintln!("{}", err.user_message());
            Ok(1)
        }
    }
}

fn run_chat(args: ChatArgs) -> Result<i32> {
    let mut engine = SubtextEngine::new(Some(args.model), args.events);
    let mut scenario_id = args.scenario;
    if engine.catalog().get(&scenario_id).is_none() {
        eprintln!("未知场景 '{scenario_id}'，可用 /scenarios 查看。");
        scenario_id = engine
            .catalog()
            .default_scenario()
            .map(|scenario| scenario.id.clone())
            .unwrap_or_default();
    }
    let mut background = args.background;
    let mut handle: Option<SessionHandle> = None;

    let stdin = io::stdin();
    let mut line = String::new();

    println!("潜台词解码已就绪。用 /analyze 或 /file 开始，/help 查看命令。");

    loop {
        print!("> ");
        io::stdout().flush()?;

        line.clear();
        let read = match stdin.read_line(&mut line) {
            Ok(read) => read,
            Err(err) if err.kind() == ErrorKind::Interrupted => continue,
            Err(err) => return Err(err.into()),
        };
        if read == 0 {
            break;
        }

        let input_line = line.trim_end_matches(['\n', '\r']);
        let intent = parse_intent(input_line);
        match intent.action.as_str() {
            "noop" => continue,
            "quit" => break,
            "help" => {
                println!("Commands: {}", CHAT_HELP_COMMANDS.join(" "));
                println!("直接输入文字即可针对最近一次分析继续追问。");
            }
            "list_scenarios" => print_scenarios(engine.catalog()),
            "set_scenario" => {
                let Some(requested) = value_as_non_empty_string(intent.command_args.get("scenario"))
                else {
                    println!("/scenario 需要一个场景 id，例如 /scenario dating");
                    continue;
                };
                if engine.catalog().get(&requested).is_none() {
                    println!("未知场景 '{requested}'，可用 /scenarios 查看。");
                    continue;
                }
                scenario_id = requested;
                println!("场景已切换为 {scenario_id}，下次分析生效。");
            }
            "set_background" => {
                background = value_as_non_empty_string(intent.command_args.get("background"));
                match &background {
                    Some(_) => println!("背景信息已记录，下次分析生效。"),
                    None => println!("背景信息已清空。"),
                }
            }
            "analyze_text" => {
                let Some(text) = value_as_non_empty_string(intent.command_args.get("text")) else {
                    println!("/analyze 需要跟上要解码的文本。");
                    continue;
                };
                if text.chars().count() > MAX_TEXT_CHARS {
                    println!("文本超过 {MAX_TEXT_CHARS} 字上限，请精简后重试。");
                    continue;
                }
                let input = AnalysisInput::text(text);
                handle = run_cycle(&mut engine, &input, &scenario_id, background.as_deref());
            }
            "analyze_file" => {
                let Some(path) = value_as_non_empty_string(intent.command_args.get("path")) else {
                    println!("/file 需要一个媒体文件路径。");
                    continue;
                };
                let input = AnalysisInput::media(PathBuf::from(path), None);
                handle = run_cycle(&mut engine, &input, &scenario_id, background.as_deref());
            }
            "show_report" => match engine.last_result() {
                Some(result) => print_report(result, engine.last_warnings()),
                None => println!("还没有分析结果。"),
            },
            "reset" => {
                engine.reset();
                handle = None;
                println!("已清空本轮分析与对话。");
            }
            "ask" => {
                let Some(question) = intent.prompt.as_deref() else {
                    continue;
                };
                // A question typed before any analysis completes is
                // dropped with a hint instead of an error.
                let Some(active) = handle else {
                    println!("先用 /analyze 或 /file 完成一次分析，再继续追问。");
                    continue;
                };
                match engine.send_chat(active, question) {
                    Ok(reply) => println!("\n{reply}\n"),
                    Err(err) => println!("{}", err.user_message()),
                }
            }
            _ => {
                let command = value_as_non_empty_string(intent.command_args.get("command"))
                    .unwrap_or_default();
                println!("未知命令 /{command}，输入 /help 查看可用命令。");
            }
        }
    }

    Ok(0)
}

fn run_cycle(
    engine: &mut SubtextEngine,
    input: &AnalysisInput,
    scenario_id: &str,
    background: Option<&str>,
) -> Option<SessionHandle> {
    println!("分析中…");
    let result = match engine.analyze(input, scenario_id, background) {
        Ok(result) => result,
        Err(err) => {
            println!("{}", err.user_message());
            return None;
        }
    };
    print_report(&result, engine.last_warnings());

    match engine.open_chat(input, scenario_id, background, &result) {
        Ok(handle) => {
            println!("可以直接输入问题继续追问。");
            Some(handle)
        }
        Err(err) => {
            println!("{}", err.user_message());
            None
        }
    }
}

fn collect_input(
    text: Option<&str>,
    file: Option<PathBuf>,
    mime: Option<String>,
) -> Result<Option<AnalysisInput>> {
    if let Some(text) = text {
        let trimmed = text.trim();
        if trimmed.is_empty() {
            return Ok(None);
        }
        if trimmed.chars().count() > MAX_TEXT_CHARS {
            anyhow::bail!("text input exceeds the {MAX_TEXT_CHARS} character bound");
        }
        return Ok(Some(AnalysisInput::text(trimmed)));
    }
    if let Some(path) = file {
        return Ok(Some(AnalysisInput::media(path, mime)));
    }
    Ok(None)
}

fn print_scenarios(catalog: &ScenarioCatalog) {
    for scenario in catalog.list() {
        println!(
            "{} {} — {}：{}",
            scenario.icon, scenario.id, scenario.name, scenario.description
        );
    }
}

fn print_report(result: &AnalysisResult, warnings: &[String]) {
    println!();
    println!("扎心指数: {:.0}/100", result.heartbreak_index);
    if let Some(value) = result.euphemism_level {
        println!("委婉程度: {value:.0}/100");
    }
    if let Some(value) = result.communication_score {
        println!("沟通段位: {value:.0}/100");
    }
    println!();
    println!("字面意思: {}", result.surface_meaning);
    println!("真实意图: {}", result.hidden_motive);
    if !result.emotional_tags.is_empty() {
        println!("情绪标签: {}", result.emotional_tags.join(" / "));
    }
    if let Some(excerpts) = result.key_excerpts.as_deref().filter(|rows| !rows.is_empty()) {
        println!();
        println!("关键摘录:");
        for excerpt in excerpts {
            println!("  “{excerpt}”");
        }
    }
    if let Some(timeline) = result
        .timeline_analysis
        .as_deref()
        .filter(|rows| !rows.is_empty())
    {
        println!();
        println!("时间轴分析:");
        for event in timeline {
            println!(
                "  [{}] {} · {}",
                event.timestamp,
                cue_label(event.cue),
                event.observation
            );
        }
    }
    if let Some(reply) = result.better_response.as_deref() {
        println!();
        println!("高情商回复: {reply}");
    }
    if let Some(advice) = result.actionable_advice.as_deref() {
        println!("行动建议: {advice}");
    }
    if let Some(cues) = result.missed_cues.as_deref().filter(|rows| !rows.is_empty()) {
        println!("被忽略的信号:");
        for cue in cues {
            println!("  - {cue}");
        }
    }
    for warning in warnings {
        eprintln!("note: {warning}");
    }
    println!();
}

fn cue_label(cue: TimelineCue) -> &'static str {
    match cue {
        TimelineCue::SpeechRate => "语速",
        TimelineCue::Tone => "语气",
        TimelineCue::Pause => "停顿",
        TimelineCue::Expression => "表情",
    }
}

fn value_as_non_empty_string(value: Option<&Value>) -> Option<String> {
    value
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|text| !text.is_empty())
        .map(str::to_string)
}
