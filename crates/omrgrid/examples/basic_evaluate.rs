use image::ImageReader;
use omrgrid::{AnswerKeySet, Evaluator, RawSheetImage, SheetInput, SheetTemplate};
use std::error::Error;
use std::path::Path;

fn main() -> Result<(), Box<dyn Error>> {
    let args: Vec<String> = std::env::args().collect();
    if args.len() < 4 {
        eprintln!(
            "Usage: {} <keys.json> <exam_set> <sheet.png> [out.json]",
            args[0]
        );
        std::process::exit(2);
    }

    let keys = AnswerKeySet::from_json_file(Path::new(&args[1]))?;
    let photo = ImageReader::open(&args[3])?.decode()?;
    let sheet_id = Path::new(&args[3])
        .file_stem()
        .map_or_else(|| args[3].clone(), |s| s.to_string_lossy().into_owned());

    let evaluator = Evaluator::new(SheetTemplate::default(), keys)?;
    let input = SheetInput::from_image(sheet_id, &args[2], RawSheetImage::from_dynamic(&photo));
    let record = evaluator.evaluate(&input);

    match (record.score_summary(), record.failure()) {
        (Some(summary), _) => println!(
            "Scored {}/{} ({} ambiguous, {} multi-mark).",
            summary.total,
            summary.max_total,
            summary.ambiguous_questions,
            summary.multi_mark_questions
        ),
        (None, Some(failure)) => println!(
            "Unresolvable at {} stage: {}",
            failure.stage, failure.message
        ),
        (None, None) => {}
    }

    if let Some(out_path) = args.get(4) {
        std::fs::write(out_path, record.to_json_string()?)?;
        println!("Wrote {out_path}");
    }
    Ok(())
}
