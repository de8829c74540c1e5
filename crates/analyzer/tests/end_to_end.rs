//! Whole-pipeline scenarios over synthetic binaries on disk

use std::path::Path;

use binlift_analyzer::{BinaryAnalyzer, DependencyKind, ResourceType};
use binlift_core::{AnalysisConfig, AnalysisStage, Architecture, BinaryFormat};

/// PE32 with a DOS header pointing at offset 128 and one `.text` section
/// (va 0x1000, raw 0x200, size 0x100) starting with `code`
fn minimal_pe(code: &[u8], imports: &[&str]) -> Vec<u8> {
    let mut file = vec![0u8; 0x400];
    file[0..2].copy_from_slice(b"MZ");
    file[0x3C..0x40].copy_from_slice(&128u32.to_le_bytes());

    let pe = 128;
    file[pe..pe + 4].copy_from_slice(b"PE\0\0");
    file[pe + 4..pe + 6].copy_from_slice(&0x014Cu16.to_le_bytes());
    let section_count: u16 = if imports.is_empty() { 1 } else { 2 };
    file[pe + 6..pe + 8].copy_from_slice(&section_count.to_le_bytes());
    file[pe + 20..pe + 22].copy_from_slice(&0xE0u16.to_le_bytes());

    let opt = pe + 24;
    file[opt..opt + 2].copy_from_slice(&0x10Bu16.to_le_bytes());
    file[opt + 16..opt + 20].copy_from_slice(&0x1000u32.to_le_bytes());
    file[opt + 28..opt + 32].copy_from_slice(&0x40_0000u32.to_le_bytes());
    file[opt + 92..opt + 96].copy_from_slice(&16u32.to_le_bytes());

    let text = opt + 0xE0;
    write_section(&mut file, text, ".text", 0x1000, 0x200, 0x6000_0020);
    file[0x200..0x200 + code.len()].copy_from_slice(code);

    if !imports.is_empty() {
        write_section(&mut file, text + 40, ".idata", 0x3000, 0x300, 0xC000_0040);
        let table = 0x300;
        let mut name_offset = (imports.len() + 1) * 20;
        for (i, name) in imports.iter().enumerate() {
            let descriptor = table + i * 20;
            let rva = 0x3000 + name_offset as u32;
            file[descriptor + 12..descriptor + 16].copy_from_slice(&rva.to_le_bytes());
            let start = table + name_offset;
            file[start..start + name.len()].copy_from_slice(name.as_bytes());
            name_offset += name.len() + 1;
        }
    }
    file
}

fn write_section(file: &mut [u8], at: usize, name: &str, va: u32, raw: u32, characteristics: u32) {
    file[at..at + name.len()].copy_from_slice(name.as_bytes());
    file[at + 8..at + 12].copy_from_slice(&0x100u32.to_le_bytes());
    file[at + 12..at + 16].copy_from_slice(&va.to_le_bytes());
    file[at + 16..at + 20].copy_from_slice(&0x100u32.to_le_bytes());
    file[at + 20..at + 24].copy_from_slice(&raw.to_le_bytes());
    file[at + 36..at + 40].copy_from_slice(&characteristics.to_le_bytes());
}

fn isolated_config() -> AnalysisConfig {
    let mut config = AnalysisConfig::default();
    config.dependencies.system_search_paths.clear();
    config
}

#[test]
fn test_minimal_pe_end_to_end() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("minimal.exe");
    std::fs::write(&path, minimal_pe(&[0x50, 0xC3], &[])).unwrap();

    let result = BinaryAnalyzer::new(isolated_config()).analyze(&path).unwrap();
    assert!(result.is_success());

    let main = result.main_analysis.as_ref().unwrap();
    assert_eq!(main.format, BinaryFormat::PE);

    let structure = main.structure.as_ref().unwrap();
    assert_eq!(structure.architecture, Architecture::X86);
    assert_eq!(structure.architecture.to_string(), "x86");
    assert_eq!(structure.sections.len(), 1);
    assert_eq!(structure.sections[0].name, ".text");

    assert_eq!(main.functions.len(), 1);
    let function = &main.functions[0];
    let mnemonics: Vec<&str> = function.instructions.iter().map(|i| i.mnemonic.as_str()).collect();
    assert_eq!(mnemonics, vec!["push", "ret"]);

    let cfg = function.cfg.as_ref().unwrap();
    assert_eq!(cfg.blocks.len(), 1);
    assert!(cfg.outgoing(0).next().is_none());
    assert!(cfg.loops.is_empty());
    assert!(main.api_calls.is_empty());
}

#[test]
fn test_directory_with_dependency_on_disk() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path();
    std::fs::create_dir(root.join("bin")).unwrap();
    std::fs::write(
        root.join("game.exe"),
        minimal_pe(&[0x50, 0xC3], &["engine.dll", "KERNEL32.dll"]),
    )
    .unwrap();
    std::fs::write(root.join("bin").join("engine.dll"), minimal_pe(&[0xC3], &["opengl32.dll"])).unwrap();
    std::fs::write(root.join("settings.ini"), "[video]\nfullscreen=1\n").unwrap();
    std::fs::write(root.join("splash.bmp"), [0u8; 12]).unwrap();

    let result = BinaryAnalyzer::new(isolated_config()).analyze(root).unwrap();
    assert_eq!(result.main_executable.as_deref(), Some(root.join("game.exe").as_path()));
    assert!(result.is_success());

    let names: Vec<&str> = result.dependencies.iter().map(|d| d.name.as_str()).collect();
    assert_eq!(names, vec!["engine.dll", "KERNEL32.dll", "opengl32.dll"]);
    assert_eq!(result.dependencies[1].kind, DependencyKind::System);
    assert_eq!(result.dependencies[2].kind, DependencyKind::Graphics);
    assert!(result.dependencies[0].is_resolved());
    assert!(!result.dependencies[1].is_resolved());

    assert_eq!(result.dependency_analyses.len(), 1);
    let engine = &result.dependency_analyses["engine.dll"];
    assert!(engine.is_success());
    assert_eq!(engine.functions.len(), 1);

    assert_eq!(
        result.configuration_files.get("settings.ini").map(String::as_str),
        Some("[video]\nfullscreen=1\n")
    );
    assert_eq!(result.resources.len(), 1);
    assert_eq!(result.resources[0].kind, ResourceType::Image);
    assert_eq!(result.resources[0].size, 12);

    let summary = result.summary();
    assert!(summary.contains("Dependencies: 3 (1 found on disk, 1 analysed)"));
}

#[test]
fn test_unrecognized_top_level_file_fails() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("readme");
    std::fs::write(&path, "plain text, not a binary").unwrap();

    let result = BinaryAnalyzer::new(isolated_config()).analyze(&path).unwrap();
    assert!(!result.is_success());
    let failure = result.main_analysis.unwrap().failure.unwrap();
    assert_eq!(failure.stage, AnalysisStage::Detect);
}

#[test]
fn test_result_round_trips_through_json() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("app.exe");
    std::fs::write(&path, minimal_pe(&[0x50, 0xC3], &[])).unwrap();

    let result = BinaryAnalyzer::new(isolated_config()).analyze(&path).unwrap();
    let json = serde_json::to_string(&result).unwrap();
    let back: binlift_analyzer::BinaryAnalysisResult = serde_json::from_str(&json).unwrap();
    assert_eq!(back.id, result.id);
    assert_eq!(back.main_analysis.unwrap().functions.len(), 1);
    assert!(Path::new(&back.input_path).ends_with("app.exe"));
}
