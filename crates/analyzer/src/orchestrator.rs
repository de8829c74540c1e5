//! Analysis pipeline driver

use std::path::{Path, PathBuf};

use binlift_binary_parser::{detect_format, parse_structure_as, BinarySource, StringExtractor};
use binlift_core::{
    AnalysisConfig, AnalysisEvent, AnalysisStage, BinaryFormat, Error, EventBus, Result,
};
use binlift_deobfuscation::DeobfuscationEngine;
use binlift_disasm::{ApiCallAnalyzer, ControlFlowAnalyzer, DisassemblyEngine};
use indexmap::IndexMap;
use rayon::prelude::*;
use tracing::{debug, info, warn};

use crate::dependency::{Dependency, DependencyWalker};
use crate::directory::scan_directory;
use crate::result::{AnalysisFailure, BinaryAnalysisResult, BinaryFileAnalysis};

/// Runs every analysis stage over a file or an application directory
pub struct BinaryAnalyzer {
    config: AnalysisConfig,
    extractor: StringExtractor,
    disassembler: DisassemblyEngine,
    cfg_analyzer: ControlFlowAnalyzer,
    api_analyzer: ApiCallAnalyzer,
    deobfuscator: DeobfuscationEngine,
    events: EventBus,
}

impl BinaryAnalyzer {
    pub fn new(config: AnalysisConfig) -> Self {
        Self {
            extractor: StringExtractor::new(config.strings.clone()),
            disassembler: DisassemblyEngine::new(config.disassembly.clone()),
            cfg_analyzer: ControlFlowAnalyzer::new(),
            api_analyzer: ApiCallAnalyzer::new(config.api.clone()),
            deobfuscator: DeobfuscationEngine::new(config.deobfuscation.clone()),
            events: EventBus::new(),
            config,
        }
    }

    pub fn config(&self) -> &AnalysisConfig {
        &self.config
    }

    /// Register a progress callback
    pub fn subscribe<F>(&mut self, callback: F)
    where
        F: Fn(&AnalysisEvent) + Send + Sync + 'static,
    {
        self.events.subscribe(callback);
    }

    /// Analyze a single binary or every relevant file under a directory
    ///
    /// Per-file failures are recorded in the result; only an unreadable input
    /// path is an error.
    pub fn analyze(&self, path: &Path) -> Result<BinaryAnalysisResult> {
        let metadata = std::fs::metadata(path).map_err(|e| Error::io(path, e))?;
        if metadata.is_dir() {
            self.analyze_directory(path)
        } else {
            Ok(self.analyze_single(path))
        }
    }

    fn analyze_single(&self, path: &Path) -> BinaryAnalysisResult {
        let mut result = BinaryAnalysisResult::new(path.to_path_buf());
        result.main_executable = Some(path.to_path_buf());
        let analysis = self.analyze_file(path);
        self.attach_dependencies(&mut result, &analysis);
        result.main_analysis = Some(analysis);
        result
    }

    fn analyze_directory(&self, dir: &Path) -> Result<BinaryAnalysisResult> {
        info!("Analyzing directory {}", dir.display());
        let listing = scan_directory(dir)?;
        let mut result = BinaryAnalysisResult::new(dir.to_path_buf());

        match listing.main_executable() {
            Some(main) => {
                result.main_executable = Some(main.clone());
                let analysis = self.analyze_file(main);
                self.attach_dependencies(&mut result, &analysis);
                result.main_analysis = Some(analysis);
            }
            None => warn!("No executable found under {}", dir.display()),
        }

        for config_path in &listing.configs {
            match std::fs::read_to_string(config_path) {
                Ok(content) => {
                    let key = config_path
                        .strip_prefix(dir)
                        .unwrap_or(config_path)
                        .display()
                        .to_string();
                    result.configuration_files.insert(key, content);
                }
                Err(e) => debug!("Skipping config file {}: {}", config_path.display(), e),
            }
        }
        result.resources = listing.resources;

        Ok(result)
    }

    /// Walk and analyze the imports of an already analyzed main executable
    fn attach_dependencies(&self, result: &mut BinaryAnalysisResult, main: &BinaryFileAnalysis) {
        if !self.config.dependencies.analyze_dependencies {
            return;
        }
        let Some(structure) = &main.structure else {
            return;
        };

        let walker = DependencyWalker::new(&self.config.dependencies, self.config.limits.max_file_size);
        walker.remember(&main.path, structure.linked_libraries.clone());
        let dependencies = walker.walk(&main.path);

        for dependency in &dependencies {
            match &dependency.path {
                Some(path) => self.events.emit(AnalysisEvent::DependencyResolved {
                    name: dependency.name.clone(),
                    path: path.clone(),
                }),
                None => {
                    warn!("Unresolved dependency {}", dependency.name);
                    self.events.emit(AnalysisEvent::DependencyUnresolved {
                        name: dependency.name.clone(),
                    });
                }
            }
        }

        result.dependency_analyses = self.analyze_dependencies(&dependencies);
        result.dependencies = dependencies;
        self.stage_done(&main.path, AnalysisStage::Dependencies);
    }

    /// Analyze every dependency found on disk, in parallel
    fn analyze_dependencies(&self, dependencies: &[Dependency]) -> IndexMap<String, BinaryFileAnalysis> {
        let located: Vec<(&str, &PathBuf)> = dependencies
            .iter()
            .filter_map(|d| d.path.as_ref().map(|path| (d.name.as_str(), path)))
            .collect();
        if located.is_empty() {
            return IndexMap::new();
        }

        let run = || -> Vec<(String, BinaryFileAnalysis)> {
            located
                .par_iter()
                .map(|(name, path)| (name.to_string(), self.analyze_file(path)))
                .collect()
        };

        let workers = self.config.limits.worker_threads;
        let analyses = if workers == 0 {
            run()
        } else {
            match rayon::ThreadPoolBuilder::new().num_threads(workers).build() {
                Ok(pool) => pool.install(run),
                Err(e) => {
                    warn!("Could not start {} worker threads, using the shared pool: {}", workers, e);
                    run()
                }
            }
        };

        analyses.into_iter().collect()
    }

    /// Run the whole pipeline over one file
    ///
    /// Never fails: the first stage that cannot proceed is recorded in
    /// `failure` and the stages before it keep their output.
    pub fn analyze_file(&self, path: &Path) -> BinaryFileAnalysis {
        info!("Analyzing {}", path.display());
        self.events.emit(AnalysisEvent::FileStarted {
            path: path.to_path_buf(),
        });

        let mut analysis = BinaryFileAnalysis::new(path.to_path_buf());
        if let Err(failure) = self.run_stages(path, &mut analysis) {
            warn!(
                "Analysis of {} stopped during {}: {}",
                path.display(),
                failure.stage,
                failure.message
            );
            self.events.emit(AnalysisEvent::FileFailed {
                path: path.to_path_buf(),
                stage: failure.stage,
                message: failure.message.clone(),
            });
            analysis.failure = Some(failure);
            return analysis;
        }

        info!(
            "Finished {}: {} functions, {} strings, {} API calls",
            path.display(),
            analysis.functions.len(),
            analysis.strings.len(),
            analysis.api_calls.len()
        );
        self.events.emit(AnalysisEvent::FileCompleted {
            path: path.to_path_buf(),
            functions: analysis.functions.len(),
            strings: analysis.strings.len(),
        });
        analysis
    }

    fn run_stages(
        &self,
        path: &Path,
        analysis: &mut BinaryFileAnalysis,
    ) -> std::result::Result<(), AnalysisFailure> {
        let data = BinarySource::open(path, self.config.limits.max_file_size)
            .map_err(|e| failure(AnalysisStage::Detect, e))?;
        analysis.file_size = data.len() as u64;

        let format = detect_format(&data);
        analysis.format = format;
        if format == BinaryFormat::Unknown {
            return Err(failure(AnalysisStage::Detect, "Unknown binary format"));
        }
        self.stage_done(path, AnalysisStage::Detect);

        let structure = parse_structure_as(format, &data)
            .map_err(|e| failure(AnalysisStage::Parse, Error::from(e)))?;
        self.stage_done(path, AnalysisStage::Parse);

        analysis.strings = self.extractor.extract_strings(&data, Some(&structure));
        analysis.string_occurrences = self.extractor.extract_with_context(&data);
        debug!("{} unique strings", analysis.strings.len());
        self.stage_done(path, AnalysisStage::Strings);

        let mut functions = self.disassembler.disassemble(&data, &structure);
        debug!("{} functions", functions.len());
        self.stage_done(path, AnalysisStage::Disassembly);

        self.cfg_analyzer.analyze_all(&mut functions);
        self.stage_done(path, AnalysisStage::ControlFlow);

        analysis.api_calls = self.api_analyzer.analyze(&functions);
        debug!("{} API calls", analysis.api_calls.len());
        self.stage_done(path, AnalysisStage::ApiCalls);

        let deobfuscation = self
            .deobfuscator
            .deobfuscate(&structure, &analysis.strings, &functions);
        self.stage_done(path, AnalysisStage::Deobfuscation);

        analysis.functions = functions;
        analysis.deobfuscation = Some(deobfuscation);
        analysis.structure = Some(structure);
        Ok(())
    }

    fn stage_done(&self, path: &Path, stage: AnalysisStage) {
        self.events.emit(AnalysisEvent::StageCompleted {
            path: path.to_path_buf(),
            stage,
        });
    }
}

impl Default for BinaryAnalyzer {
    fn default() -> Self {
        Self::new(AnalysisConfig::default())
    }
}

fn failure(stage: AnalysisStage, message: impl ToString) -> AnalysisFailure {
    AnalysisFailure {
        stage,
        message: message.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::pe_image;
    use std::sync::{Arc, Mutex};

    fn analyzer() -> BinaryAnalyzer {
        let mut config = AnalysisConfig::default();
        config.dependencies.system_search_paths.clear();
        BinaryAnalyzer::new(config)
    }

    #[test]
    fn test_analyze_file_runs_every_stage() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app.exe");
        std::fs::write(&path, pe_image(&[])).unwrap();

        let stages = Arc::new(Mutex::new(Vec::new()));
        let mut analyzer = analyzer();
        let seen = stages.clone();
        analyzer.subscribe(move |event| {
            if let AnalysisEvent::StageCompleted { stage, .. } = event {
                seen.lock().unwrap().push(*stage);
            }
        });

        let analysis = analyzer.analyze_file(&path);
        assert!(analysis.is_success());
        assert_eq!(analysis.format, BinaryFormat::PE);
        assert_eq!(analysis.functions.len(), 1);
        assert!(analysis.functions[0].cfg.is_some());
        assert!(analysis.deobfuscation.is_some());
        assert_eq!(
            *stages.lock().unwrap(),
            vec![
                AnalysisStage::Detect,
                AnalysisStage::Parse,
                AnalysisStage::Strings,
                AnalysisStage::Disassembly,
                AnalysisStage::ControlFlow,
                AnalysisStage::ApiCalls,
                AnalysisStage::Deobfuscation,
            ]
        );
    }

    #[test]
    fn test_unknown_format_is_recorded() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("notes.bin");
        std::fs::write(&path, b"just some text").unwrap();

        let failed = Arc::new(Mutex::new(None));
        let mut analyzer = analyzer();
        let seen = failed.clone();
        analyzer.subscribe(move |event| {
            if let AnalysisEvent::FileFailed { stage, .. } = event {
                *seen.lock().unwrap() = Some(*stage);
            }
        });

        let analysis = analyzer.analyze_file(&path);
        assert_eq!(analysis.file_size, 14);
        assert_eq!(
            analysis.failure,
            Some(AnalysisFailure {
                stage: AnalysisStage::Detect,
                message: "Unknown binary format".into(),
            })
        );
        assert!(analysis.structure.is_none());
        assert_eq!(*failed.lock().unwrap(), Some(AnalysisStage::Detect));
    }

    #[test]
    fn test_structural_error_stops_at_parse() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.exe");
        std::fs::write(&path, b"MZ\0\0").unwrap();

        let analysis = analyzer().analyze_file(&path);
        assert_eq!(analysis.format, BinaryFormat::PE);
        assert_eq!(analysis.failure.map(|f| f.stage), Some(AnalysisStage::Parse));
    }

    #[test]
    fn test_zip_container_is_unsupported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bundle.jar");
        std::fs::write(&path, b"PK\x03\x04rest of archive").unwrap();

        let analysis = analyzer().analyze_file(&path);
        assert_eq!(analysis.format, BinaryFormat::ZipBased);
        assert_eq!(
            analysis.failure,
            Some(AnalysisFailure {
                stage: AnalysisStage::Parse,
                message: "Unsupported format: ZIP".into(),
            })
        );
    }

    #[test]
    fn test_oversized_file_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("big.exe");
        std::fs::write(&path, pe_image(&[])).unwrap();

        let mut config = AnalysisConfig::default();
        config.limits.max_file_size = 16;
        let analysis = BinaryAnalyzer::new(config).analyze_file(&path);
        let failure = analysis.failure.unwrap();
        assert_eq!(failure.stage, AnalysisStage::Detect);
        assert!(failure.message.contains("File too large"));
    }

    #[test]
    fn test_single_file_walks_dependencies() {
        let dir = tempfile::tempdir().unwrap();
        let main = dir.path().join("app.exe");
        std::fs::write(&main, pe_image(&["helper.dll", "missing.dll"])).unwrap();
        std::fs::write(dir.path().join("helper.dll"), pe_image(&[])).unwrap();

        let result = analyzer().analyze(&main).unwrap();
        assert!(result.is_success());
        assert_eq!(result.dependencies.len(), 2);
        assert_eq!(result.dependency_analyses.len(), 1);
        assert!(result.dependency_analyses["helper.dll"].is_success());
    }

    #[test]
    fn test_dependency_stage_follows_main_stages() {
        let dir = tempfile::tempdir().unwrap();
        let main = dir.path().join("app.exe");
        std::fs::write(&main, pe_image(&["helper.dll"])).unwrap();
        std::fs::write(dir.path().join("helper.dll"), pe_image(&[])).unwrap();

        let stages = Arc::new(Mutex::new(Vec::new()));
        let mut analyzer = analyzer();
        let seen = stages.clone();
        let main_path = main.clone();
        analyzer.subscribe(move |event| match event {
            AnalysisEvent::StageCompleted { path, stage } if *path == main_path => {
                seen.lock().unwrap().push(*stage);
            }
            _ => {}
        });

        analyzer.analyze(&main).unwrap();
        let stages = stages.lock().unwrap();
        assert_eq!(stages.len(), 8);
        assert_eq!(stages[6], AnalysisStage::Deobfuscation);
        assert_eq!(stages[7], AnalysisStage::Dependencies);
    }

    #[test]
    fn test_dependencies_can_be_disabled() {
        let dir = tempfile::tempdir().unwrap();
        let main = dir.path().join("app.exe");
        std::fs::write(&main, pe_image(&["helper.dll"])).unwrap();
        std::fs::write(dir.path().join("helper.dll"), pe_image(&[])).unwrap();

        let mut config = AnalysisConfig::default();
        config.dependencies.analyze_dependencies = false;
        let mut analyzer = BinaryAnalyzer::new(config);
        let walked = Arc::new(Mutex::new(false));
        let seen = walked.clone();
        analyzer.subscribe(move |event| {
            if let AnalysisEvent::StageCompleted {
                stage: AnalysisStage::Dependencies,
                ..
            } = event
            {
                *seen.lock().unwrap() = true;
            }
        });

        let result = analyzer.analyze(&main).unwrap();
        assert!(result.dependencies.is_empty());
        assert!(result.dependency_analyses.is_empty());
        assert!(!*walked.lock().unwrap());
    }

    #[test]
    fn test_bounded_worker_pool() {
        let dir = tempfile::tempdir().unwrap();
        let main = dir.path().join("app.exe");
        std::fs::write(&main, pe_image(&["a.dll", "b.dll"])).unwrap();
        std::fs::write(dir.path().join("a.dll"), pe_image(&[])).unwrap();
        std::fs::write(dir.path().join("b.dll"), pe_image(&[])).unwrap();

        let mut config = AnalysisConfig::default();
        config.dependencies.system_search_paths.clear();
        config.limits.worker_threads = 1;
        let result = BinaryAnalyzer::new(config).analyze(&main).unwrap();
        let keys: Vec<&String> = result.dependency_analyses.keys().collect();
        assert_eq!(keys, vec!["a.dll", "b.dll"]);
    }

    #[test]
    fn test_missing_input_is_an_error() {
        assert!(matches!(
            analyzer().analyze(Path::new("/nonexistent/input.exe")),
            Err(Error::Io { .. })
        ));
    }
}
